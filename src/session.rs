//! The session: everything one endpoint needs to jam over midi.
//!
//! [`jam_session::JamSession`] is the facade the UI talks to.  [`client::run`] builds one
//! from the config file and drives it from a dedicated thread.
pub mod client;
pub mod jam_session;
pub mod param_message;
pub mod routing;
