//! Ring of recently executed instruction addresses

/// Fixed-capacity history of canonical addresses, oldest entries dropped first
#[derive(Clone, Debug)]
pub struct TraceBuffer {
    entries: Vec<u32>,
    next: usize,
    filled: bool,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        TraceBuffer {
            entries: vec![0; capacity.max(1)],
            next: 0,
            filled: false,
        }
    }

    #[inline]
    pub fn push(&mut self, address: u32) {
        self.entries[self.next] = address;
        self.next += 1;
        if self.next == self.entries.len() {
            self.next = 0;
            self.filled = true;
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        if self.filled {
            self.entries.len()
        } else {
            self.next
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest first
    pub fn recent(&self) -> Vec<u32> {
        if self.filled {
            let (newer, older) = self.entries.split_at(self.next);
            older.iter().chain(newer).copied().collect()
        } else {
            self.entries[..self.next].to_vec()
        }
    }

    pub fn clear(&mut self) {
        self.next = 0;
        self.filled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraps_oldest_first() {
        let mut t = TraceBuffer::new(3);
        assert!(t.is_empty());
        for a in 1..=5 {
            t.push(a);
        }
        assert_eq!(t.len(), 3);
        assert_eq!(t.recent(), vec![3, 4, 5]);
        t.clear();
        t.push(9);
        assert_eq!(t.recent(), vec![9]);
    }
}
