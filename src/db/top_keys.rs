//! Hot-key frequency sketch.
//!
//! A small fixed matrix of (fingerprint, count, key) cells. Touching a key
//! either bumps its cell or decays the resident entry, replacing it once the
//! count reaches zero. Disabled (zero-size) by default; enabling it costs a
//! few kilobytes per database.

use bytes::Bytes;

#[derive(Debug, Clone, Default)]
struct Cell {
    fingerprint: u64,
    count: u64,
    key: Option<Bytes>,
}

/// Sampling sketch of the most frequently touched keys.
#[derive(Debug, Default)]
pub struct TopKeys {
    cells: Vec<Cell>,
}

impl TopKeys {
    /// A disabled sketch; `touch` is a no-op.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_capacity(cells: usize) -> Self {
        Self {
            cells: vec![Cell::default(); cells],
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.cells.is_empty()
    }

    pub fn touch(&mut self, key: &[u8]) {
        if self.cells.is_empty() {
            return;
        }
        let fp = crate::table::dash_hash(key);
        let idx = (fp % self.cells.len() as u64) as usize;
        let cell = &mut self.cells[idx];

        if cell.count == 0 {
            cell.fingerprint = fp;
            cell.count = 1;
            cell.key = Some(Bytes::copy_from_slice(key));
        } else if cell.fingerprint == fp {
            cell.count += 1;
        } else {
            // Space-saving decay: a stream of distinct keys drains the
            // resident entry before replacing it.
            cell.count -= 1;
            if cell.count == 0 {
                cell.key = None;
            }
        }
    }

    /// Snapshot of resident keys and their estimated counts.
    pub fn entries(&self) -> Vec<(Bytes, u64)> {
        self.cells
            .iter()
            .filter_map(|c| c.key.clone().map(|k| (k, c.count)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_is_noop() {
        let mut tk = TopKeys::disabled();
        tk.touch(b"k");
        assert!(tk.entries().is_empty());
    }

    #[test]
    fn test_hot_key_dominates() {
        let mut tk = TopKeys::with_capacity(64);
        for _ in 0..100 {
            tk.touch(b"hot");
        }
        tk.touch(b"cold");
        let entries = tk.entries();
        let hot = entries
            .iter()
            .find(|(k, _)| k.as_ref() == b"hot")
            .expect("hot key resident");
        assert!(hot.1 >= 99);
    }
}
