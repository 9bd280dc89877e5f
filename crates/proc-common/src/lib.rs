pub mod cgroup;
pub mod connector;
pub mod procfs;

pub use nix::unistd::Pid;

/// Log an error together with its whole source chain.
///
/// A bare `{:?}` on an error stops at the outermost message and hides the
/// causes underneath, which is where the interesting part usually is.
/// Routing the error through anyhow first gets us the chain rendering
/// without writing our own formatter.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{msg}: {:?}", anyhow::Error::from(err));
}
