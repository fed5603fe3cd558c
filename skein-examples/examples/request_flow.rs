//! Flows, tags, and a timing extension: a request pipeline with contextual
//! user ids and validated input.
//!
//! Run with: `cargo run -p skein-examples --example request_flow`

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use skein::{
    tag, AnyValue, Atom, BoxError, ContextOptions, DisposeOptions, ExecNext, ExecTarget,
    Extension, ExecutionContext, Flow, Scope, ScopeError, Tag,
};

struct Timing;

#[async_trait]
impl Extension for Timing {
    fn name(&self) -> &str {
        "timing"
    }

    async fn wrap_exec(
        &self,
        target: ExecTarget,
        _ctx: ExecutionContext,
        next: ExecNext,
    ) -> Result<AnyValue, ScopeError> {
        let started = Instant::now();
        let result = next().await;
        println!(
            "[timing] {} took {:?}",
            target.name.as_deref().unwrap_or("<anonymous>"),
            started.elapsed()
        );
        result
    }
}

#[tokio::main]
async fn main() -> Result<(), skein::ScopeError> {
    let user_id = Tag::<String>::new("user.id");

    let greeting_prefix = Atom::of("greeting_prefix", "hello".to_string());
    let greet = {
        let user_id_handle = user_id.clone();
        let prefix_handle = greeting_prefix.clone();
        Flow::<String, String>::builder()
            .name("greet")
            .dep(&greeting_prefix)
            .dep_tag(tag::required(&user_id))
            .parse(|name| {
                if name.trim().is_empty() {
                    Err("name must not be empty".to_string())
                } else {
                    Ok(name)
                }
            })
            .build(move |ctx, name, deps| {
                let user_id = user_id_handle.clone();
                let prefix = prefix_handle.clone();
                async move {
                    let prefix = deps.get(&prefix)?;
                    let caller = ctx.get_tag(&user_id)?;
                    Ok::<_, BoxError>(format!("{prefix}, {name}! (for {caller})"))
                }
            })
    };

    let scope = Scope::builder().extension(Arc::new(Timing)).build();
    scope.ready().await?;

    let ctx =
        scope.create_context(ContextOptions::new().tag(user_id.bind("u-42".to_string())?))?;

    let message = ctx.exec(&greet, "world".to_string()).await?;
    println!("{message}");

    if let Err(err) = ctx.exec(&greet, "   ".to_string()).await {
        println!("rejected as expected: {err}");
    }

    ctx.close(skein::CloseMode::Graceful).await?;
    scope.dispose(DisposeOptions::new()).await?;
    Ok(())
}
