/// In-memory copy of one RRA's circular buffer
///
/// Rows are addressed relative to the write cursor: age 0 is the most
/// recent CDP, age `rows - 1` the oldest one still retained.
#[derive(Debug, Clone, PartialEq)]
pub struct Ring {
    slots: Vec<f64>,
}

impl Ring {
    /// Ring of `rows` unknown slots
    pub fn new(rows: u32) -> Self {
        Self {
            slots: vec![f64::NAN; rows as usize],
        }
    }

    pub(crate) fn from_slots(slots: Vec<f64>) -> Self {
        Self { slots }
    }

    pub fn rows(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn get(&self, row: u32) -> f64 {
        self.slots[row as usize]
    }

    pub fn set(&mut self, row: u32, value: f64) {
        self.slots[row as usize] = value;
    }

    /// Row after `cursor`, wrapping to the start
    pub fn next_row(&self, cursor: u32) -> u32 {
        (cursor + 1) % self.rows()
    }

    /// Row holding the CDP written `age` CDPs before the one at `cursor`
    pub fn row_at_age(&self, cursor: u32, age: u32) -> u32 {
        let rows = self.rows();
        (cursor + rows - age % rows) % rows
    }

    pub fn slots(&self) -> &[f64] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ring_is_unknown() {
        let ring = Ring::new(4);
        assert_eq!(ring.rows(), 4);
        assert!(ring.slots().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_cursor_wraps() {
        let mut ring = Ring::new(3);
        let mut cursor = ring.rows() - 1;
        for value in [1.0, 2.0, 3.0, 4.0] {
            cursor = ring.next_row(cursor);
            ring.set(cursor, value);
        }

        // Oldest value was overwritten
        assert_eq!(cursor, 0);
        assert_eq!(ring.get(ring.row_at_age(cursor, 0)), 4.0);
        assert_eq!(ring.get(ring.row_at_age(cursor, 1)), 3.0);
        assert_eq!(ring.get(ring.row_at_age(cursor, 2)), 2.0);
    }
}
