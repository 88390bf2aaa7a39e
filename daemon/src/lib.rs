//! seedwatch: watches a torrent client's JSON status file and raises alerts
//! when torrents complete, pass halfway, pause, stall, resume or disappear.

pub mod alert;
pub mod config;
pub mod detector;
pub mod event;
pub mod paths;
pub mod poller;
pub mod snapshot;
pub mod status;
