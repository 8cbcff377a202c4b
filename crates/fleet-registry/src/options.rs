//! Options for registry writes.

/// Controls how [`Registry::update`](crate::Registry::update) merges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Write every field of the caller's object instead of merging only the
    /// spec onto the stored object. The caller's `resource_version` must
    /// match storage.
    pub all_fields: bool,
    /// Skip the write and return the stored object when the spec hash is
    /// unchanged.
    pub when_spec_changed: bool,
}

impl UpdateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_fields(mut self) -> Self {
        self.all_fields = true;
        self
    }

    pub fn when_spec_changed(mut self) -> Self {
        self.when_spec_changed = true;
        self
    }
}

/// Controls [`Registry::delete`](crate::Registry::delete).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Wait until the record is physically removed (finalizers drained).
    pub sync: bool,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }
}
