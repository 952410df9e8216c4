/// Lowest generation a node or pointer can be written at
pub(crate) const MIN_GENERATION: u64 = 1;
/// Generations are stored in 4 bytes on the page
pub(crate) const MAX_GENERATION: u64 = u32::MAX as u64;

/// The pair of generations every tree operation runs under.
///
/// Everything written since the last checkpoint is tagged with `unstable`. Anything tagged with a
/// generation up to `stable` survived a checkpoint and must stay reachable until the next one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Generation {
    stable: u64,
    unstable: u64,
}

impl Generation {
    pub(crate) fn new(stable: u64, unstable: u64) -> Self {
        assert!(stable >= MIN_GENERATION && stable < unstable && unstable <= MAX_GENERATION);
        Self { stable, unstable }
    }

    /// Generation of a tree that has never been checkpointed
    pub(crate) fn initial() -> Self {
        Self::new(MIN_GENERATION, MIN_GENERATION + 1)
    }

    pub(crate) fn stable(&self) -> u64 {
        self.stable
    }

    pub(crate) fn unstable(&self) -> u64 {
        self.unstable
    }

    /// The generation in effect once the current unstable generation has been checkpointed
    pub(crate) fn next(&self) -> Self {
        Self::new(self.unstable, self.unstable + 1)
    }
}
