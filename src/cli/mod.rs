mod ann;
mod inspect;
mod random;

pub use ann::*;
pub use inspect::*;
pub use random::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
