//! tally-camera: Camera event plumbing for snapshot-driven attendance.
//!
//! Watches an IP camera's alarm channel, grabs a still frame when an alarm
//! fires, and hands the file to a [`SnapshotSink`].

pub mod alarm;
pub mod backoff;
pub mod capture;
pub mod connector;
pub mod listener;
pub mod sink;

pub use alarm::{AlarmEvent, MessageFramer};
pub use backoff::Backoff;
pub use capture::{CaptureError, CaptureLimits, FfmpegGrabber, FrameGrabber, RtspSource};
pub use connector::{EventConnector, EventStream, TcpConnector};
pub use listener::{CameraEventListener, ListenerConfig, ListenerState};
pub use sink::SnapshotSink;
