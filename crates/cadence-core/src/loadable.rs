//! Fetch state for values read from the chain in the background
//!
//! A read is `Idle` until something asks for it, `Loading` until the first
//! success and `Loaded` afterwards. Transient failures keep the previous
//! step and attach a message the UI can show as a non-blocking banner.

/// Human-readable description of the last failed fetch
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FetchError {
    pub message: String,
}

/// Progress of a background read
#[derive(Clone, PartialEq, Debug, Default)]
pub enum LoadStep<T> {
    #[default]
    Idle,
    Loading,
    Loaded(T),
}

/// A background read with its optional transient error
#[derive(Clone, PartialEq, Debug)]
pub struct Loadable<T> {
    pub step: LoadStep<T>,
    pub error: Option<FetchError>,
}

impl<T> Default for Loadable<T> {
    fn default() -> Self {
        Loadable::idle()
    }
}

impl<T> Loadable<T> {
    pub fn idle() -> Self {
        Loadable {
            step: LoadStep::Idle,
            error: None,
        }
    }

    pub fn loading() -> Self {
        Loadable {
            step: LoadStep::Loading,
            error: None,
        }
    }

    pub fn loaded(value: T) -> Self {
        Loadable {
            step: LoadStep::Loaded(value),
            error: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(FetchError {
            message: message.into(),
        });
        self
    }

    /// Loaded value, if any
    pub fn value(&self) -> Option<&T> {
        match &self.step {
            LoadStep::Loaded(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.step, LoadStep::Loaded(_))
    }
}
