use crate::event::Event;
use dyn_clone::{clone_trait_object, DynClone};

/// A predicate deciding whether an event proceeds to the transports.
/// Filters run in order on the manager's accept queue; the first rejection
/// drops the event silently.
pub trait Filter: DynClone + Send + Sync {
    fn should_accept(&self, event: &Event) -> bool;
}

clone_trait_object!(Filter);

/// Wraps a plain closure as a filter.
#[derive(Clone)]
pub struct CallbackFilter<F: Fn(&Event) -> bool + Clone + Send + Sync>(pub F);

impl<F: Fn(&Event) -> bool + Clone + Send + Sync> Filter for CallbackFilter<F> {
    fn should_accept(&self, event: &Event) -> bool {
        (self.0)(event)
    }
}

/// Accepts only events whose subsystem starts with one of the configured
/// prefixes. An empty prefix list accepts everything.
#[derive(Clone, Debug, Default)]
pub struct SubsystemFilter {
    prefixes: Vec<String>,
}

impl SubsystemFilter {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(prefixes: I) -> SubsystemFilter {
        SubsystemFilter {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl Filter for SubsystemFilter {
    fn should_accept(&self, event: &Event) -> bool {
        self.prefixes.is_empty()
            || self
                .prefixes
                .iter()
                .any(|prefix| event.subsystem.starts_with(prefix))
    }
}
