//! Reactive atoms: a counter, a derived value, and a select subscription.
//!
//! Run with: `cargo run -p skein-examples --example counter`

use skein::{Atom, BoxError, DisposeOptions, Scope};

#[tokio::main]
async fn main() -> Result<(), skein::ScopeError> {
    let counter = Atom::of("counter", 0i64);
    let doubled = {
        let counter_handle = counter.clone();
        Atom::builder()
            .label("doubled")
            .dep(&counter)
            .build(move |ctx| {
                let counter = counter_handle.clone();
                async move { Ok::<_, BoxError>(*ctx.get(&counter)? * 2) }
            })
    };

    let scope = Scope::new();
    println!("doubled = {}", scope.resolve(&doubled).await?);

    let parity = scope.select(&doubled, |v: &i64| v % 2 == 0);
    let _subscription = parity
        .subscribe(|even| println!("doubled is now {}", if *even { "even" } else { "odd" }))?;

    let controller = scope.controller(&counter);
    for step in 1..=3 {
        controller.set(step).await?;
        scope.flush().await?;
        println!("counter = {step}, doubled = {}", scope.resolve(&doubled).await?);
    }

    scope.dispose(DisposeOptions::new()).await?;
    Ok(())
}
