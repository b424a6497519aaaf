//! H.264 NAL unit classification for RTP payloads.
//!
//! The distributor only needs to know two things about a payload: whether
//! it starts a decodable point (IDR or parameter set) and whether it is a
//! parameter set worth caching for late subscribers.

const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterSet {
    Sps,
    Pps,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    /// Payload starts an IDR frame or carries a parameter set.
    pub is_keyframe: bool,
    /// Parameter set type when the payload is (or begins with) one.
    pub parameter_set: Option<ParameterSet>,
}

fn classify_plain(nal_type: u8) -> Classification {
    match nal_type {
        NAL_IDR => Classification {
            is_keyframe: true,
            parameter_set: None,
        },
        NAL_SPS => Classification {
            is_keyframe: true,
            parameter_set: Some(ParameterSet::Sps),
        },
        NAL_PPS => Classification {
            is_keyframe: true,
            parameter_set: Some(ParameterSet::Pps),
        },
        _ => Classification::default(),
    }
}

/// Classify an RTP H.264 payload. Aggregation packets (STAP-A) are
/// classified by their first contained NAL; fragmented units (FU-A) only
/// on the starting fragment, so a keyframe is flagged exactly once.
pub fn classify(payload: &[u8]) -> Classification {
    if payload.is_empty() {
        return Classification::default();
    }
    let nal_type = payload[0] & 0x1F;
    match nal_type {
        NAL_STAP_A => {
            // header(1) + nalu-size(2) + first nalu header
            if payload.len() > 3 {
                classify_plain(payload[3] & 0x1F)
            } else {
                Classification::default()
            }
        }
        NAL_FU_A => {
            if payload.len() > 1 && payload[1] & 0x80 != 0 {
                classify_plain(payload[1] & 0x1F)
            } else {
                Classification::default()
            }
        }
        t => classify_plain(t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_nal_types() {
        assert_eq!(
            classify(&[0x65, 0x00]),
            Classification {
                is_keyframe: true,
                parameter_set: None
            }
        );
        assert_eq!(classify(&[0x67]).parameter_set, Some(ParameterSet::Sps));
        assert_eq!(classify(&[0x68]).parameter_set, Some(ParameterSet::Pps));
        // Non-IDR slice (type 1) is not a keyframe.
        assert_eq!(classify(&[0x41, 0x00]), Classification::default());
    }

    #[test]
    fn stap_a_uses_first_contained_nal() {
        // STAP-A header, 2-byte size, then an SPS header.
        let pkt = [0x78, 0x00, 0x04, 0x67, 0xAA, 0xBB, 0xCC];
        let c = classify(&pkt);
        assert!(c.is_keyframe);
        assert_eq!(c.parameter_set, Some(ParameterSet::Sps));
        // Truncated STAP-A is ignored.
        assert_eq!(classify(&[0x78, 0x00]), Classification::default());
    }

    #[test]
    fn fu_a_only_flags_starting_fragment() {
        // FU indicator type 28, FU header with start bit and type 5.
        let start = [0x7C, 0x85, 0x01, 0x02];
        assert!(classify(&start).is_keyframe);
        // Continuation fragment of the same IDR: no start bit.
        let middle = [0x7C, 0x05, 0x03, 0x04];
        assert!(!classify(&middle).is_keyframe);
        // End fragment.
        let end = [0x7C, 0x45, 0x05];
        assert!(!classify(&end).is_keyframe);
    }

    #[test]
    fn empty_payload_is_inert() {
        assert_eq!(classify(&[]), Classification::default());
    }
}
