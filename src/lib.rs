//! SIP (RFC 3261) proxy/registrar core with digest auth, CDR, and an
//! embedded RTP auto-dialer. See `SPEC_FULL.md` for the module map.

pub mod auth;
pub mod cdr;
pub mod config;
pub mod dialer;
pub mod dialog_store;
pub mod error;
pub mod media;
pub mod message;
pub mod registrar;
pub mod routing;
pub mod sdp;
pub mod state;
pub mod timers;
pub mod transport;
pub mod uri;
pub mod users;
