//! Runtime-index to measurement-identity mapping
//!
//! The publisher assigns each subscribed signal a small runtime index and
//! distributes the mapping in an `UpdateSignalIndexCache` response. Compact
//! records and buffer blocks only carry that index.
//!
//! A cache is immutable once parsed. [`SignalIndexCacheHandle`] swaps whole
//! caches atomically, so a decoder holding a snapshot never observes a mix of
//! two mappings.

use arc_swap::ArcSwapOption;
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::types::OperationalEncoding;
use crate::wire::{PacketReader, text};
use crate::{Result, SubscriberError};

/// Identity of one subscribed signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEntry {
    pub signal_id: Uuid,
    pub source: Arc<str>,
    pub point_id: u32,
}

/// Point-in-time mapping distributed by the publisher.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SignalIndexCache {
    subscriber_id: Uuid,
    entries: HashMap<u16, SignalEntry>,
    unauthorized: Vec<Uuid>,
}

impl SignalIndexCache {
    pub fn new(
        subscriber_id: Uuid,
        entries: impl IntoIterator<Item = (u16, SignalEntry)>,
        unauthorized: Vec<Uuid>,
    ) -> Self {
        Self { subscriber_id, entries: entries.into_iter().collect(), unauthorized }
    }

    /// Deserializes the common binary form.
    ///
    /// Layout: total length, subscriber id, entry count, entries, then the
    /// unauthorized signal ids.
    pub fn parse(data: &[u8], encoding: OperationalEncoding) -> Result<Self> {
        let mut reader = PacketReader::new(data, "signal index cache");

        let total_length = reader.read_i32()?;
        if total_length < 0 || total_length as usize > data.len() {
            return Err(SubscriberError::decode_error(
                "signal index cache",
                format!("declared length {total_length} exceeds {} available bytes", data.len()),
            ));
        }

        let subscriber_id = reader.read_guid()?;
        let count = read_count(&mut reader)?;

        let mut entries = HashMap::with_capacity(count.min(65_536));
        for _ in 0..count {
            let runtime_index = reader.read_u16()?;
            let signal_id = reader.read_guid()?;
            let source = text::decode(reader.read_sized_bytes()?, encoding)?;
            let point_id = reader.read_u32()?;
            let entry = SignalEntry { signal_id, source: Arc::from(source), point_id };
            entries.insert(runtime_index, entry);
        }

        let unauthorized_count = read_count(&mut reader)?;
        let mut unauthorized = Vec::with_capacity(unauthorized_count.min(65_536));
        for _ in 0..unauthorized_count {
            unauthorized.push(reader.read_guid()?);
        }

        Ok(Self { subscriber_id, entries, unauthorized })
    }

    /// Serializes to the same binary form [`parse`](Self::parse) reads.
    pub fn encode(&self, encoding: OperationalEncoding) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_slice(self.subscriber_id.as_bytes());
        body.put_i32(self.entries.len() as i32);

        let mut indexes: Vec<_> = self.entries.keys().copied().collect();
        indexes.sort_unstable();
        for index in indexes {
            let entry = &self.entries[&index];
            body.put_u16(index);
            body.put_slice(entry.signal_id.as_bytes());
            text::put_sized_string(&mut body, &entry.source, encoding);
            body.put_u32(entry.point_id);
        }

        body.put_i32(self.unauthorized.len() as i32);
        for id in &self.unauthorized {
            body.put_slice(id.as_bytes());
        }

        let mut out = Vec::with_capacity(body.len() + 4);
        out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub fn lookup(&self, runtime_index: u16) -> Option<&SignalEntry> {
        self.entries.get(&runtime_index)
    }

    pub fn subscriber_id(&self) -> Uuid {
        self.subscriber_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Signals the publisher accepted for this subscriber.
    pub fn authorized_signal_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.entries.values().map(|entry| entry.signal_id)
    }

    /// Signals requested but refused by the publisher.
    pub fn unauthorized_signal_ids(&self) -> &[Uuid] {
        &self.unauthorized
    }
}

fn read_count(reader: &mut PacketReader<'_>) -> Result<usize> {
    let count = reader.read_i32()?;
    usize::try_from(count)
        .map_err(|_| {
            SubscriberError::decode_error("signal index cache", format!("negative count {count}"))
        })
}

/// Atomically replaceable reference to the active cache.
#[derive(Debug, Default)]
pub struct SignalIndexCacheHandle {
    current: ArcSwapOption<SignalIndexCache>,
}

impl SignalIndexCacheHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the active cache; later replacements do not affect it.
    pub fn load(&self) -> Option<Arc<SignalIndexCache>> {
        self.current.load_full()
    }

    pub fn replace(&self, cache: SignalIndexCache) {
        self.current.store(Some(Arc::new(cache)));
    }

    pub fn clear(&self) {
        self.current.store(None);
    }

    pub fn is_present(&self) -> bool {
        self.current.load().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(n: u32) -> SignalEntry {
        SignalEntry {
            signal_id: Uuid::from_u128(u128::from(n) + 1),
            source: Arc::from("PPA"),
            point_id: n,
        }
    }

    #[test]
    fn parses_entries_and_unauthorized_ids() {
        let cache = SignalIndexCache::new(
            Uuid::from_u128(99),
            [(0, entry(10)), (7, entry(11))],
            vec![Uuid::from_u128(500)],
        );
        let bytes = cache.encode(OperationalEncoding::Utf8);
        let parsed = SignalIndexCache::parse(&bytes, OperationalEncoding::Utf8).unwrap();

        assert_eq!(parsed.subscriber_id(), Uuid::from_u128(99));
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.lookup(7).unwrap().point_id, 11);
        assert_eq!(&*parsed.lookup(0).unwrap().source, "PPA");
        assert!(parsed.lookup(1).is_none());
        assert_eq!(parsed.unauthorized_signal_ids(), &[Uuid::from_u128(500)]);
        assert_eq!(parsed.authorized_signal_ids().count(), 2);
    }

    #[test]
    fn declared_length_beyond_buffer_is_rejected() {
        let mut bytes = SignalIndexCache::default().encode(OperationalEncoding::Utf8);
        bytes[0..4].copy_from_slice(&1000i32.to_be_bytes());
        assert!(matches!(
            SignalIndexCache::parse(&bytes, OperationalEncoding::Utf8),
            Err(SubscriberError::Decode { .. })
        ));
    }

    #[test]
    fn handle_snapshot_survives_replacement() {
        let handle = SignalIndexCacheHandle::new();
        assert!(handle.load().is_none());

        handle.replace(SignalIndexCache::new(Uuid::nil(), [(1, entry(1))], Vec::new()));
        let snapshot = handle.load().unwrap();
        handle.replace(SignalIndexCache::new(Uuid::nil(), [(1, entry(2))], Vec::new()));

        assert_eq!(snapshot.lookup(1).unwrap().point_id, 1);
        assert_eq!(handle.load().unwrap().lookup(1).unwrap().point_id, 2);

        handle.clear();
        assert!(!handle.is_present());
    }

    proptest! {
        #[test]
        fn truncated_caches_never_panic(cut in 0usize..200) {
            let cache = SignalIndexCache::new(
                Uuid::from_u128(1),
                (0u16..5).map(|i| (i, entry(u32::from(i)))),
                vec![Uuid::from_u128(2)],
            );
            let bytes = cache.encode(OperationalEncoding::Unicode);
            let cut = cut.min(bytes.len());
            let result = SignalIndexCache::parse(&bytes[..cut], OperationalEncoding::Unicode);
            if cut < bytes.len() {
                prop_assert!(result.is_err());
            } else {
                prop_assert_eq!(result.unwrap(), cache);
            }
        }
    }
}
