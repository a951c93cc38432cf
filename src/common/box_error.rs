//! type created so that the errors can be moved between threads.
//!
//! The session runs on its own thread and the signaling websocket on another, so
//! every fallible call in the plumbing returns this.
pub type BoxError = std::boxed::Box<
    dyn std::error::Error // must implement Error to satisfy ?
        + std::marker::Send // needed for threads
        + std::marker::Sync, // needed for threads
>;
