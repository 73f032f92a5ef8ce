//! Locator-based incremental reads over a chain.
//!
//! A client sends the hashes it has already seen (its locator): txids, chain
//! hashes, or the `new_top` of its last page. The chain is scanned from the
//! tail backward; the newest entry named by the locator is the resume point
//! and the page starts right after it. An empty locator, or one matching
//! nothing, starts from the beginning.
//!
//! `new_top` is the tail hash when a page reaches the end of the chain. A
//! page cut short by the limit carries the chain hash of its last entry
//! instead, so `new_top` is always a valid next locator.

use std::collections::HashSet;

use crate::types::{ChainEntry, Hash256};

pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// One slice of a chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    pub entries: Vec<ChainEntry>,
    /// Next locator: the tail hash (null for an empty chain), or the last
    /// entry's chain hash when the page was cut short.
    pub new_top: Hash256,
}

/// Chain hash of the last live entry.
pub fn tail_hash(chain: &[ChainEntry]) -> Hash256 {
    chain
        .iter()
        .rev()
        .find(|e| !e.revoked)
        .map(|e| e.chain_hash)
        .unwrap_or(Hash256::ZERO)
}

/// Index at which a page for `locator` starts. An entry matches by txid or
/// by chain hash; the current tail hash resumes at the end of the chain.
pub fn resume_index(chain: &[ChainEntry], locator: &[Hash256]) -> usize {
    if locator.is_empty() {
        return 0;
    }
    let seen: HashSet<&Hash256> = locator.iter().collect();
    let top = tail_hash(chain);
    if !top.is_zero() && seen.contains(&top) {
        return chain.len();
    }
    chain
        .iter()
        .rposition(|e| seen.contains(&e.txid) || seen.contains(&e.chain_hash))
        .map_or(0, |i| i + 1)
}

pub fn page(chain: &[ChainEntry], locator: &[Hash256], limit: usize) -> Page {
    let start = resume_index(chain, locator);
    let entries: Vec<ChainEntry> = chain.iter().skip(start).take(limit).copied().collect();
    let end = start + entries.len();
    let new_top = match entries.last() {
        Some(last) if end < chain.len() => last.chain_hash,
        _ => tail_hash(chain),
    };
    Page { entries, new_top }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::build;
    use crate::types::{Account, AccountId, TxId, TxRef};
    use proptest::prelude::*;

    fn chain_of(n: u32) -> Vec<ChainEntry> {
        let txs = (0..n)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[..4].copy_from_slice(&i.to_be_bytes());
                bytes[31] = 1;
                TxRef {
                    txid: Hash256(bytes),
                    height: u64::from(i / 3),
                    position: i % 3,
                }
            })
            .collect();
        build(&[Account {
            id: AccountId::from_bytes([9; 32]),
            txs,
        }])
    }

    #[test]
    fn empty_chain_has_null_top() {
        let p = page(&[], &[], DEFAULT_PAGE_LIMIT);
        assert!(p.entries.is_empty());
        assert_eq!(p.new_top, Hash256::ZERO);
    }

    #[test]
    fn empty_locator_starts_at_beginning() {
        let chain = chain_of(5);
        let p = page(&chain, &[], 2);
        assert_eq!(p.entries, chain[..2].to_vec());
        assert_eq!(p.new_top, chain[1].chain_hash);
        let rest = page(&chain, &[], 10);
        assert_eq!(rest.new_top, chain[4].chain_hash);
    }

    #[test]
    fn resumes_after_newest_match() {
        let chain = chain_of(6);
        let locator = vec![chain[1].txid, chain[3].txid];
        assert_eq!(resume_index(&chain, &locator), 4);
        let p = page(&chain, &locator, 10);
        assert_eq!(p.entries, chain[4..].to_vec());
    }

    #[test]
    fn unmatched_locator_starts_at_beginning() {
        let chain = chain_of(3);
        assert_eq!(resume_index(&chain, &[Hash256([0xFF; 32])]), 0);
    }

    #[test]
    fn caught_up_client_gets_empty_page() {
        let chain = chain_of(4);
        let p = page(&chain, &[chain[3].txid], 10);
        assert!(p.entries.is_empty());
        assert_eq!(p.new_top, chain[3].chain_hash);
    }

    #[test]
    fn new_top_is_a_valid_locator() {
        let chain = chain_of(4);
        let first = page(&chain, &[], 2);
        let second = page(&chain, &[first.new_top], 2);
        assert_eq!(second.entries, chain[2..].to_vec());
        assert_eq!(second.new_top, chain[3].chain_hash);
        let caught_up = page(&chain, &[second.new_top], 2);
        assert!(caught_up.entries.is_empty());
    }

    #[test]
    fn tail_hash_resumes_past_revoked_tail() {
        let mut chain = chain_of(3);
        chain[2].revoked = true;
        let p = page(&chain, &[tail_hash(&chain)], 10);
        assert!(p.entries.is_empty());
    }

    #[test]
    fn revoked_tail_is_skipped_for_top() {
        let mut chain = chain_of(3);
        chain[2].revoked = true;
        assert_eq!(tail_hash(&chain), chain[1].chain_hash);
    }

    proptest! {
        #[test]
        fn paging_visits_every_entry_once(n in 0u32..60, limit in 1usize..12) {
            let chain = chain_of(n);
            let mut seen: Vec<ChainEntry> = Vec::new();
            let mut locator: Vec<TxId> = Vec::new();
            loop {
                let p = page(&chain, &locator, limit);
                prop_assert!(p.entries.len() <= limit);
                if p.entries.is_empty() {
                    break;
                }
                locator = p.entries.iter().map(|e| e.txid).collect();
                seen.extend(p.entries);
            }
            prop_assert_eq!(seen, chain);
        }

        #[test]
        fn paging_by_new_top_visits_every_entry_once(n in 0u32..60, limit in 1usize..12) {
            let chain = chain_of(n);
            let mut seen: Vec<ChainEntry> = Vec::new();
            let mut locator: Vec<Hash256> = Vec::new();
            loop {
                let p = page(&chain, &locator, limit);
                if p.entries.is_empty() {
                    break;
                }
                locator = vec![p.new_top];
                seen.extend(p.entries);
            }
            prop_assert_eq!(seen, chain);
        }
    }
}
