mod entry;

use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Context as _;
pub use entry::{CacheFlags, CachedAnswer};
use hashlink::LinkedHashMap;
use pine_dns_lib::{Decode as _, DnsMessage, Encode as _, Question, WireBuf};

const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// The lookup key for a resolved answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// ASCII-lowercased, since names compare case-insensitively
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl CacheKey {
    pub fn for_question(question: &Question<'_>) -> Self {
        CacheKey {
            qname: question.qname.to_ascii_lowercase(),
            qtype: question.qtype.into(),
            qclass: question.qclass,
        }
    }

    fn to_question(&self) -> Question<'static> {
        Question {
            qname: self.qname.clone().into(),
            qtype: self.qtype.into(),
            qclass: self.qclass,
        }
    }
}

/// TTL-indexed answer store.
///
/// The whole table sits behind one coarse mutex: the resolver writes from
/// the worker tasks, and diagnostic reads may come from anywhere. The lock
/// is held only for the duration of a table operation, never across I/O,
/// and replacement is atomic per key. Capacity is bounded; the oldest
/// insertion is evicted to make room.
pub struct Cache {
    table: Mutex<LinkedHashMap<CacheKey, CachedAnswer>>,
    capacity: usize,
}

impl Cache {
    pub fn with_capacity(capacity: usize) -> Self {
        Cache {
            table: Mutex::new(LinkedHashMap::with_capacity(capacity)),
            capacity,
        }
    }

    /// Returns the unexpired answer for a key, lazily evicting an expired
    /// one found in its place.
    pub fn get(&self, key: &CacheKey, now: Instant) -> Option<CachedAnswer> {
        let mut table = self.table.lock().expect("cache lock poisoned");
        match table.get(key) {
            Some(entry) if now >= entry.expires_at => {
                table.remove(key);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// Inserts or fully replaces the answer for a key.
    pub fn put(&self, key: CacheKey, answer: CachedAnswer) {
        let mut table = self.table.lock().expect("cache lock poisoned");
        if !table.contains_key(&key) && table.len() >= self.capacity {
            table.pop_front();
        }
        table.insert(key, answer);
    }

    /// Removes every expired entry, bounding memory from entries that are
    /// never looked up again. Returns the number of evictions.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut table = self.table.lock().expect("cache lock poisoned");
        let expired: Vec<CacheKey> = table
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            table.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.table.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Diagnostic read surface: every live entry with its remaining TTL.
    pub fn snapshot(&self, now: Instant) -> Vec<(CacheKey, u32, CacheFlags)> {
        let table = self.table.lock().expect("cache lock poisoned");
        table
            .iter()
            .filter(|(_, entry)| now < entry.expires_at)
            .map(|(key, entry)| (key.clone(), entry.remaining_ttl(now), entry.flags))
            .collect()
    }

    /// Writes every live entry to `path` as length-prefixed wire messages,
    /// the same shape an upstream reply has.
    pub fn persist(&self, path: &Path, now: Instant) -> anyhow::Result<usize> {
        // Snapshot under the lock, encode and write without it
        let entries: Vec<(CacheKey, CachedAnswer)> = {
            let table = self.table.lock().expect("cache lock poisoned");
            table
                .iter()
                .filter(|(_, entry)| now < entry.expires_at)
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect()
        };

        let mut out: Vec<u8> = Vec::new();
        for (key, entry) in &entries {
            let mut message = DnsMessage::new();
            message.header.is_response = true;
            message.header.response_code = entry.rcode;
            message.questions.push(key.to_question());
            message.header.question_count = 1;
            for rr in entry.answers_at(now) {
                message.answers.push(rr);
                message.header.answer_count += 1;
            }
            for rr in entry.authorities_at(now) {
                message.authorities.push(rr);
                message.header.authority_count += 1;
            }

            let mut buf = WireBuf::new_empty(None);
            message
                .encode(&mut buf, None)
                .context("error while encoding a cache entry")?;
            out.extend_from_slice(&(buf.len() as u16).to_be_bytes());
            out.extend_from_slice(&buf);
        }

        std::fs::write(path, &out)
            .with_context(|| format!("error while writing the cache file '{}'", path.display()))?;
        Ok(entries.len())
    }

    /// Loads entries persisted by [`Cache::persist`]. Corrupt frames are
    /// skipped, not fatal.
    pub fn load(&self, path: &Path, now: Instant, negative_ttl_floor: u32) -> anyhow::Result<usize> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("error while reading the cache file '{}'", path.display()))?;

        let mut offset = 0;
        let mut loaded = 0;
        while offset + 2 <= bytes.len() {
            let length = u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap()) as usize;
            offset += 2;
            let Some(frame) = bytes.get(offset..offset + length) else {
                break;
            };
            offset += length;

            let Ok(message) = DnsMessage::decode(&mut WireBuf::new(frame)) else {
                continue;
            };
            let Some(question) = message.questions.first() else {
                continue;
            };
            let key = CacheKey::for_question(question);
            let answer = CachedAnswer::from_reply(&message, now, negative_ttl_floor);
            if answer.is_cacheable(now) {
                self.put(key, answer);
                loaded += 1;
            }
        }

        Ok(loaded)
    }
}

impl Default for Cache {
    fn default() -> Self {
        Cache::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}
