//! Fine-grained selector subscriptions.
//!
//! A [`SelectHandle`] derives a slice of an atom's value through a selector
//! and notifies listeners only when the equality function reports a change.
//! The handle subscribes to the atom lazily on the first listener (acquiring
//! a retention reference) and lets go when the last listener unsubscribes.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::atom::{Atom, EventFilter, Subscription};
use crate::error::ScopeError;
use crate::scope::Scope;

type SelectorFn<T, S> = Box<dyn Fn(&T) -> S + Send + Sync>;
type EqFn<S> = Box<dyn Fn(&S, &S) -> bool + Send + Sync>;
type SelectListener<S> = Arc<dyn Fn(&S) + Send + Sync>;

struct SelectState<S> {
    listeners: Vec<(u64, SelectListener<S>)>,
    next_id: u64,
    last: Option<S>,
    upstream: Option<Subscription>,
}

struct SelectShared<T, S> {
    scope: Scope,
    atom: Atom<T>,
    selector: SelectorFn<T, S>,
    eq: EqFn<S>,
    state: Mutex<SelectState<S>>,
}

impl<T, S> SelectShared<T, S>
where
    T: Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    fn on_transition(shared: &Arc<Self>) {
        let Some(next) = shared
            .scope
            .peek(&shared.atom)
            .map(|value| (shared.selector)(&value))
        else {
            return;
        };
        let to_notify = {
            let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = match &state.last {
                Some(previous) => !(shared.eq)(previous, &next),
                None => true,
            };
            if changed {
                state.last = Some(next.clone());
                state.listeners.clone()
            } else {
                Vec::new()
            }
        };
        for (_, listener) in to_notify {
            listener(&next);
        }
    }
}

/// Derived subscription over one atom: selector plus equality gate.
pub struct SelectHandle<T, S> {
    shared: Arc<SelectShared<T, S>>,
}

impl<T, S> Clone for SelectHandle<T, S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, S> fmt::Debug for SelectHandle<T, S>
where
    T: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectHandle")
            .field("atom", &self.shared.atom.id())
            .finish()
    }
}

impl<T, S> SelectHandle<T, S>
where
    T: Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(scope: Scope, atom: Atom<T>, selector: SelectorFn<T, S>, eq: EqFn<S>) -> Self {
        Self {
            shared: Arc::new(SelectShared {
                scope,
                atom,
                selector,
                eq,
                state: Mutex::new(SelectState {
                    listeners: Vec::new(),
                    next_id: 0,
                    last: None,
                    upstream: None,
                }),
            }),
        }
    }

    /// Applies the selector to the current value; `None` while the atom is
    /// unresolved.
    pub fn get(&self) -> Option<S> {
        self.shared
            .scope
            .peek(&self.shared.atom)
            .map(|value| (self.shared.selector)(&value))
    }

    /// Registers a listener fired on equality-gated changes. The first
    /// listener subscribes to the atom and acquires a retention reference;
    /// dropping the returned subscription undoes both when it was the last.
    pub fn subscribe(
        &self,
        listener: impl Fn(&S) + Send + Sync + 'static,
    ) -> Result<SelectSubscription<T, S>, ScopeError> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push((id, Arc::new(listener)));

        if state.upstream.is_none() {
            self.shared.scope.acquire_ref(&self.shared.atom)?;
            state.last = self.get();
            let weak = Arc::downgrade(&self.shared);
            let upstream = self
                .shared
                .scope
                .controller(&self.shared.atom)
                .on(EventFilter::Any, move |_event| {
                    if let Some(shared) = weak.upgrade() {
                        SelectShared::on_transition(&shared);
                    }
                });
            match upstream {
                Ok(upstream) => state.upstream = Some(upstream),
                Err(err) => {
                    state.listeners.retain(|(entry, _)| *entry != id);
                    let _ = self.shared.scope.release_ref(&self.shared.atom);
                    return Err(err);
                }
            }
        }
        Ok(SelectSubscription {
            shared: Arc::downgrade(&self.shared),
            id,
        })
    }
}

/// Listener registration returned by [`SelectHandle::subscribe`]; dropping
/// it unsubscribes.
pub struct SelectSubscription<T: Send + Sync + 'static, S> {
    shared: Weak<SelectShared<T, S>>,
    id: u64,
}

impl<T: Send + Sync + 'static, S> SelectSubscription<T, S> {
    /// Removes the listener now instead of at drop.
    pub fn unsubscribe(self) {}
}

impl<T: Send + Sync + 'static, S> Drop for SelectSubscription<T, S> {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let released = {
            let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.listeners.retain(|(id, _)| *id != self.id);
            if state.listeners.is_empty() {
                state.upstream = None;
                state.last = None;
                true
            } else {
                false
            }
        };
        if released {
            // Last listener gone: drop the retention ref so GC may reclaim.
            let _ = shared.scope.release_ref(&shared.atom);
        }
    }
}

impl Scope {
    /// A select handle with the default equality (`PartialEq`).
    pub fn select<T, S>(
        &self,
        atom: &Atom<T>,
        selector: impl Fn(&T) -> S + Send + Sync + 'static,
    ) -> SelectHandle<T, S>
    where
        T: Send + Sync + 'static,
        S: PartialEq + Clone + Send + Sync + 'static,
    {
        SelectHandle::new(
            self.clone(),
            atom.clone(),
            Box::new(selector),
            Box::new(|a, b| a == b),
        )
    }

    /// A select handle with a custom equality function.
    pub fn select_with_eq<T, S>(
        &self,
        atom: &Atom<T>,
        selector: impl Fn(&T) -> S + Send + Sync + 'static,
        eq: impl Fn(&S, &S) -> bool + Send + Sync + 'static,
    ) -> SelectHandle<T, S>
    where
        T: Send + Sync + 'static,
        S: Clone + Send + Sync + 'static,
    {
        SelectHandle::new(self.clone(), atom.clone(), Box::new(selector), Box::new(eq))
    }
}
