// vim: tw=80
use crate::errors::{Error, Result};

/// One run of a sparse resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Segment {
    /// `length` bytes present in the payload.
    Data(u64),
    /// `length` bytes of zeros omitted from the payload.
    Hole(u64),
}

impl Segment {
    pub fn len(&self) -> u64 {
        match *self {
            Segment::Data(n) | Segment::Hole(n) => n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Alternating data/hole description of a resource's logical layout.
///
/// The manifest encodes this as a signed length list: positive entries are
/// data runs, negative entries are holes.
#[derive(Clone, Debug, Default)]
pub struct SparseMap {
    segments: Vec<Segment>,
}

impl SparseMap {
    pub fn from_lengths(lengths: &[i64]) -> Result<Self> {
        let mut segments = Vec::with_capacity(lengths.len());
        for &len in lengths {
            if len > 0 {
                segments.push(Segment::Data(len as u64));
            } else if len < 0 {
                let hole = len
                    .checked_neg()
                    .ok_or_else(|| Error::Domain(
                        "sparse map hole length overflows".into(),
                    ))?;
                segments.push(Segment::Hole(hole as u64));
            } else {
                return Err(Error::Domain(
                    "sparse map entries must be nonzero".into(),
                ));
            }
        }
        Ok(SparseMap { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Bytes actually present in the payload.
    pub fn data_size(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Data(n) => *n,
                Segment::Hole(_) => 0,
            })
            .sum()
    }

    /// Logical size of the resource, holes included.
    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Length of the trailing hole, or 0 if the map ends in data.
    pub fn ending_hole_size(&self) -> u64 {
        match self.segments.last() {
            Some(Segment::Hole(n)) => *n,
            _ => 0,
        }
    }

    /// `(logical_offset, length)` of each data run, in order.
    pub fn data_runs(&self) -> Vec<(u64, u64)> {
        let mut runs = Vec::new();
        let mut pos = 0u64;
        for seg in &self.segments {
            if let Segment::Data(n) = seg {
                runs.push((pos, *n));
            }
            pos += seg.len();
        }
        runs
    }
}
