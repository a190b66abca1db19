//! Nonce reservation for concurrently submitted groups.

use crate::{chain::ChainClient, error::Result};

/// A contiguous range of nonces reserved for one group of transactions.
///
/// Windows are read from the live transaction count at group start and never
/// persisted: after a failure the next group or run reserves a fresh window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceWindow {
    start: u64,
    size: u64,
    issued: u64,
}

impl NonceWindow {
    pub fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            size,
            issued: 0,
        }
    }

    /// Reserve `size` nonces starting at the sender's live transaction count.
    pub async fn reserve<C: ChainClient>(client: &C, size: usize) -> Result<Self> {
        let start = client.get_transaction_count(client.sender()).await?;
        let window = Self::new(start, size as u64);
        tracing::debug!(start, end = window.end(), "Reserved nonce window");
        Ok(window)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last nonce of the window.
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.issued
    }

    pub fn contains(&self, nonce: u64) -> bool {
        (self.start..self.end()).contains(&nonce)
    }

    /// Hand out the next nonce, `None` once the window is exhausted.
    pub fn next_nonce(&mut self) -> Option<u64> {
        if self.issued == self.size {
            return None;
        }
        let nonce = self.start + self.issued;
        self.issued += 1;
        Some(nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_hands_out_consecutive_nonces() {
        let mut window = NonceWindow::new(7, 3);
        assert_eq!(window.end(), 10);
        assert!(window.contains(9));
        assert!(!window.contains(10));

        assert_eq!(window.next_nonce(), Some(7));
        assert_eq!(window.next_nonce(), Some(8));
        assert_eq!(window.remaining(), 1);
        assert_eq!(window.next_nonce(), Some(9));
        assert_eq!(window.next_nonce(), None);
        assert_eq!(window.remaining(), 0);
    }

    #[test]
    fn test_empty_window() {
        let mut window = NonceWindow::new(4, 0);
        assert!(window.is_empty());
        assert_eq!(window.next_nonce(), None);
    }
}
