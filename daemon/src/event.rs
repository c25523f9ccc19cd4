use crate::config::Config;

pub enum DaemonEvent {
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// Ctrl+C received; stop monitoring and exit.
    Shutdown,
}
