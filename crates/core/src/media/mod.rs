//! H.264 framing helpers.
//!
//! The RTSP client delivers each access unit as length-prefixed NAL units
//! (AVCC, ISO/IEC 14496-15) and the parameter sets as an AVC decoder
//! configuration record. Everything downstream of ingest (the motion
//! transcoder, the recording transcoder and the live track) consumes
//! Annex-B byte streams instead:
//!
//! ```text
//! AVCC:    [len:4][NAL][len:4][NAL]...
//! Annex-B: 00 00 00 01 SPS 00 00 00 01 PPS 00 00 00 01 NAL 00 00 00 01 NAL...
//! ```
//!
//! Every access unit is sent with the SPS/PPS prefix so a decoder can start
//! at any frame.

pub mod h264;

pub use h264::{ParameterSets, access_unit_to_annexb};
