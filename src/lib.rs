mod core;
mod lock;
mod logger;
mod node;
mod tree;

pub use self::logger::{Log, NoopLogger};
pub use self::tree::AvlSet;
