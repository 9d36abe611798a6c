use std::fmt;

use serde::{Deserialize, Serialize};

/// The identity of a log entry: the term in which it was created and its position in the log.
///
/// The derived ordering compares `term` first and `index` second, which is exactly the Raft
/// "at least as up-to-date" comparison of two logs' last entries.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        LogId { term, index }
    }
}

impl From<(u64, u64)> for LogId {
    fn from(v: (u64, u64)) -> Self {
        LogId::new(v.0, v.1)
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_id_orders_by_term_then_index() {
        assert!(LogId::new(2, 1) > LogId::new(1, 100));
        assert!(LogId::new(2, 5) > LogId::new(2, 4));
        assert_eq!(LogId::new(3, 3), LogId::from((3, 3)));
        assert_eq!(LogId::default(), LogId::new(0, 0));
    }
}
