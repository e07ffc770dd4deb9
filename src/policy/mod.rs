//! Sandbox policy compilation.
//!
//! Each producer returns a [`Fragment`]; the assembler merges them in a fixed
//! order behind the base skeleton and closes the list with the exec target.

pub mod assembler;
pub mod audio;
pub mod directive;
pub mod display;
pub mod env;
pub mod misc;
pub mod skeleton;

pub use assembler::{AssembledPolicy, ProxyMode, assemble};
pub use directive::{BindMode, Directive, DirectiveList, SandboxCommand};
pub use env::EnvSet;

/// Ordered partial directive list from one producer, plus the environment
/// entries it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    pub name: &'static str,
    pub directives: DirectiveList,
    pub env: Vec<String>,
}

impl Fragment {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            directives: DirectiveList::new(),
            env: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty() && self.env.is_empty()
    }
}
