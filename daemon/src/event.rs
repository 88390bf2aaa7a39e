use crate::config::Config;
use crate::detector::PollReport;

pub enum DaemonEvent {
    /// A poll finished (successfully or as a no-op); carries its alerts and
    /// the detector status taken under the same lock.
    Polled(PollReport),
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// Ctrl+C received; write a final status and exit.
    Shutdown,
}
