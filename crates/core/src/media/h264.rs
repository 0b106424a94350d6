use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{NvrError, Result};

/// Annex-B 4-byte start code.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Length prefix size of the access units produced by the RTSP client.
const NAL_LENGTH_SIZE: usize = 4;

/// H.264 sequence and picture parameter sets (ITU-T H.264 §7.3.2.1, §7.3.2.2).
///
/// Only the first SPS and first PPS are kept; cameras send one of each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

impl ParameterSets {
    /// Parse an AVC decoder configuration record (ISO/IEC 14496-15 §5.2.4.1).
    ///
    /// ```text
    /// version(1) profile(1) compat(1) level(1)
    /// 0b111111 lengthSizeMinusOne(2)
    /// 0b111 numSPS(5)  { len(2) sps } * numSPS
    /// numPPS(1)        { len(2) pps } * numPPS
    /// ```
    pub fn from_avc_decoder_config(record: &[u8]) -> Result<Self> {
        let mut reader = RecordReader::new(record);
        let version = reader.u8()?;
        if version != 1 {
            return Err(NvrError::StreamUnusable(format!(
                "avcC version {version}"
            )));
        }
        reader.skip(4)?;

        let num_sps = reader.u8()? & 0x1f;
        let mut sps = None;
        for _ in 0..num_sps {
            let nal = reader.sized()?;
            sps.get_or_insert_with(|| nal.to_vec());
        }

        let num_pps = reader.u8()?;
        let mut pps = None;
        for _ in 0..num_pps {
            let nal = reader.sized()?;
            pps.get_or_insert_with(|| nal.to_vec());
        }

        match (sps, pps) {
            (Some(sps), Some(pps)) => Ok(Self { sps, pps }),
            _ => Err(NvrError::StreamUnusable(
                "avcC record without SPS/PPS".to_string(),
            )),
        }
    }

    /// Capture SPS (type 7) and PPS (type 8) from an Annex-B bitstream.
    pub fn from_annexb(data: &[u8]) -> Option<Self> {
        let mut sps = None;
        let mut pps = None;
        for nal in extract_nal_units(data) {
            match nal.first().map(|b| b & 0x1f) {
                Some(7) if sps.is_none() => sps = Some(nal),
                Some(8) if pps.is_none() => pps = Some(nal),
                _ => {}
            }
        }
        Some(Self {
            sps: sps?,
            pps: pps?,
        })
    }

    /// `startcode SPS startcode PPS startcode`.
    ///
    /// Prepended to every access unit so a decoder can join at any frame.
    pub fn annexb_prefix(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(3 * START_CODE.len() + self.sps.len() + self.pps.len());
        out.put_slice(&START_CODE);
        out.put_slice(&self.sps);
        out.put_slice(&START_CODE);
        out.put_slice(&self.pps);
        out.put_slice(&START_CODE);
        out.freeze()
    }
}

struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(NvrError::StreamUnusable("truncated avcC record".to_string()));
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn sized(&mut self) -> Result<&'a [u8]> {
        let len = self.take(2)?;
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        self.take(len)
    }
}

/// Build the Annex-B form of one access unit: `prefix` followed by the NAL
/// units of `avcc`, separated by start codes.
///
/// `prefix` ends in a start code, so the first NAL unit needs none of its
/// own. A truncated trailing NAL unit is dropped.
pub fn access_unit_to_annexb(prefix: &[u8], avcc: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(prefix.len() + avcc.len() + 16);
    out.put_slice(prefix);

    let mut pos = 0usize;
    let mut first = true;
    while pos + NAL_LENGTH_SIZE <= avcc.len() {
        let len = u32::from_be_bytes([avcc[pos], avcc[pos + 1], avcc[pos + 2], avcc[pos + 3]])
            as usize;
        pos += NAL_LENGTH_SIZE;
        if len == 0 || pos + len > avcc.len() {
            tracing::trace!(len, remaining = avcc.len() - pos, "truncated NAL unit dropped");
            break;
        }
        if !first {
            out.put_slice(&START_CODE);
        }
        out.put_slice(&avcc[pos..pos + len]);
        pos += len;
        first = false;
    }

    out.freeze()
}

/// Split an Annex-B byte stream into NAL units, start codes removed.
///
/// Accepts `00 00 01` and `00 00 00 01` delimiters, mixed freely. A unit
/// ends where the next delimiter begins, so a four-byte delimiter after a
/// unit does not leave a stray zero byte on its tail. Empty units are
/// skipped.
pub fn extract_nal_units(data: &[u8]) -> Vec<Vec<u8>> {
    // (delimiter offset, payload offset) per unit
    let mut bounds: Vec<(usize, usize)> = Vec::new();
    let mut i = 0usize;
    while i + 3 <= data.len() {
        if data[i..].starts_with(&START_CODE) {
            bounds.push((i, i + START_CODE.len()));
            i += START_CODE.len();
        } else if data[i..].starts_with(&[0, 0, 1]) {
            bounds.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    bounds
        .iter()
        .enumerate()
        .filter_map(|(n, &(_, payload))| {
            let end = bounds.get(n + 1).map_or(data.len(), |&(next, _)| next);
            (payload < end).then(|| data[payload..end].to_vec())
        })
        .collect()
}
