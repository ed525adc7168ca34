//! Dense presence set over OSM node ids.
//!
//! Two instances drive the two-pass scan: `shape` marks every id referenced
//! by any routable way, `intersection` marks ids referenced by two or more
//! ways plus the first/last id of every way. Sized by the configured maximum
//! OSM id (~500 MB for 4e9 ids, which is fine on a build host).

use anyhow::Result;
use bit_vec::BitVec;

use crate::error::FatalError;

pub struct NodeIdTable {
    max_osm_id: u64,
    bits: BitVec,
}

impl NodeIdTable {
    pub fn new(max_osm_id: u64) -> Self {
        Self {
            max_osm_id,
            bits: BitVec::from_elem(max_osm_id as usize + 1, false),
        }
    }

    /// Mark an id as present. Ids past the configured maximum mean the
    /// extract has outgrown the bound and the build must be re-run.
    pub fn set(&mut self, id: u64) -> Result<()> {
        if id > self.max_osm_id {
            return Err(FatalError::OsmIdOutOfRange {
                id,
                max: self.max_osm_id,
            }
            .into());
        }
        self.bits.set(id as usize, true);
        Ok(())
    }

    pub fn is_set(&self, id: u64) -> bool {
        self.bits.get(id as usize).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut table = NodeIdTable::new(1000);
        assert!(!table.is_set(0));
        assert!(!table.is_set(999));

        table.set(0).unwrap();
        table.set(999).unwrap();
        table.set(1000).unwrap();

        assert!(table.is_set(0));
        assert!(table.is_set(999));
        assert!(table.is_set(1000));
        assert!(!table.is_set(500));
    }

    #[test]
    fn test_out_of_range_is_fatal() {
        let mut table = NodeIdTable::new(100);
        assert!(table.set(101).is_err());
    }

    #[test]
    fn test_out_of_range_read_is_false() {
        let table = NodeIdTable::new(10);
        assert!(!table.is_set(5000));
    }
}
