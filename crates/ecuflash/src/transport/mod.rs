//! Transport layers for ECU communication
//!
//! Two layers live here:
//! - the raw CAN link (`CanLink`), with a SocketCAN implementation and the
//!   test doubles used by the rest of the crate, and
//! - the ISO 15765-2 segmented transport (`IsoTpEndpoint`) that frames
//!   payloads of up to 4095 bytes onto 8-byte classical CAN frames.
//!
//! Every frame crossing a link is reported to an injected [`FrameSink`];
//! the file appender produces the plain-text audit log.

pub mod error;
pub mod isotp;
pub mod link;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use error::TransportError;
pub use isotp::{decode_st_min, IsoTpEndpoint, MAX_PDU};
pub use link::{audit_line, CanFrame, CanLink, Direction, FrameLog, FrameSink, TraceSink};
pub use mock::ScriptedLink;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use socketcan::SocketCanLink;

use std::sync::Arc;

/// Open the hardware link for `interface`, filtered to the given
/// `(id, mask)` pairs, with an optional audit sink.
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub fn open_link(
    interface: &str,
    filters: &[(u16, u16)],
    sink: Option<Arc<dyn FrameSink>>,
) -> Result<Arc<dyn CanLink>, TransportError> {
    let mut link = SocketCanLink::open(interface, filters)?;
    if let Some(sink) = sink {
        link = link.with_sink(sink);
    }
    Ok(Arc::new(link))
}

#[cfg(not(all(target_os = "linux", feature = "socketcan")))]
pub fn open_link(
    _interface: &str,
    _filters: &[(u16, u16)],
    _sink: Option<Arc<dyn FrameSink>>,
) -> Result<Arc<dyn CanLink>, TransportError> {
    Err(TransportError::Unsupported(
        "hardware CAN requires Linux and the 'socketcan' feature".to_string(),
    ))
}
