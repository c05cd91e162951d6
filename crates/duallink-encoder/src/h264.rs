//! Minimal H.264 Annex-B inspection: enough to split NAL units and tell an
//! IDR access unit from a delta one.

// ── NAL unit types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    Slice,
    IdrSlice,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    Other(u8),
}

impl NalUnitType {
    pub fn from_header(header: u8) -> Self {
        match header & 0x1F {
            1 => Self::Slice,
            5 => Self::IdrSlice,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::AccessUnitDelimiter,
            other => Self::Other(other),
        }
    }
}

// ── Annex-B scanning ──────────────────────────────────────────────────────────

/// Length of the start code at `data[i..]` (3 or 4), if any.
fn start_code_at(data: &[u8], i: usize) -> Option<usize> {
    match data.get(i..) {
        Some([0, 0, 1, ..]) => Some(3),
        Some([0, 0, 0, 1, ..]) => Some(4),
        _ => None,
    }
}

/// Iterator over NAL unit payloads (header byte first, start codes stripped).
pub struct NalUnits<'a> {
    data: &'a [u8],
    pos:  usize,
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let data = self.data;
        loop {
            let start = loop {
                if self.pos + 3 > data.len() {
                    return None;
                }
                if let Some(len) = start_code_at(data, self.pos) {
                    break self.pos + len;
                }
                self.pos += 1;
            };

            let mut end = start;
            while end < data.len() && start_code_at(data, end).is_none() {
                end += 1;
            }
            self.pos = end;

            // Trailing zero bytes belong to the next start code.
            let mut unit = &data[start..end];
            while let [rest @ .., 0] = unit {
                unit = rest;
            }
            if !unit.is_empty() {
                return Some(unit);
            }
        }
    }
}

pub fn nal_units(data: &[u8]) -> NalUnits<'_> {
    NalUnits { data, pos: 0 }
}

pub fn nal_unit_types(data: &[u8]) -> impl Iterator<Item = NalUnitType> + '_ {
    nal_units(data).map(|unit| NalUnitType::from_header(unit[0]))
}

/// An access unit is a keyframe when it carries an IDR slice.
pub fn is_keyframe(data: &[u8]) -> bool {
    nal_unit_types(data).any(|t| t == NalUnitType::IdrSlice)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0xE0, 0x1F];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80];
    const IDR: &[u8] = &[0, 0, 1, 0x65, 0x88, 0x84, 0x21];
    const SLICE: &[u8] = &[0, 0, 0, 1, 0x41, 0x9A, 0x02];

    #[test]
    fn idr_access_unit_is_keyframe() {
        let au = [SPS, PPS, IDR].concat();
        let types: Vec<_> = nal_unit_types(&au).collect();
        assert_eq!(types, vec![NalUnitType::Sps, NalUnitType::Pps, NalUnitType::IdrSlice]);
        assert!(is_keyframe(&au));
    }

    #[test]
    fn non_idr_slice_is_delta() {
        assert!(!is_keyframe(SLICE));
        // SPS/PPS alone do not make a keyframe.
        assert!(!is_keyframe(&[SPS, PPS, SLICE].concat()));
    }

    #[test]
    fn payloads_exclude_start_codes() {
        let au = [SPS, IDR].concat();
        let units: Vec<_> = nal_units(&au).collect();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], &SPS[4..]);
        assert_eq!(units[1], &IDR[3..]);
    }

    #[test]
    fn garbage_yields_nothing() {
        assert_eq!(nal_units(&[]).count(), 0);
        assert_eq!(nal_units(&[0x65, 0x88, 0x84]).count(), 0);
        assert_eq!(nal_units(&[0, 0, 1]).count(), 0);
        assert!(!is_keyframe(&[0, 0, 0, 0]));
    }

    #[test]
    fn long_runs_of_empty_units_are_skipped() {
        let mut au = [0, 0, 1].repeat(200_000);
        au.extend_from_slice(IDR);
        let units: Vec<_> = nal_units(&au).collect();
        assert_eq!(units, vec![&IDR[3..]]);
        assert!(is_keyframe(&au));
    }
}
