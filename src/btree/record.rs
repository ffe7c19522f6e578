//! Leaf records and their bucket partitioning.
//!
//! Records inside a leaf are arranged into buckets so that a point query
//! reads, verifies, and decompresses one bucket instead of the whole leaf.
//! Buckets fill to `max_bucket_length` bytes and a record larger than the
//! cap gets a bucket of its own.

use eyre::Result;

use super::msg::Cursor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Record {
        Record { key, value }
    }

    pub fn size(&self) -> usize {
        4 + self.key.len() + 4 + self.value.len()
    }
}

/// On-disk descriptor of one bucket, refreshed at serialization time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketInfo {
    pub first_key: Vec<u8>,
    pub offset: u32,
    pub length: u32,
    pub uncompressed: u32,
    pub crc: u16,
}

#[derive(Debug, Default)]
pub struct Bucket {
    /// Present once the bucket has been serialized or deserialized.
    pub info: Option<BucketInfo>,
    /// Payload byte length: the record-count prefix plus all records.
    length: usize,
    /// `None` while the contents still live only on disk.
    pub records: Option<Vec<Record>>,
}

impl Bucket {
    fn loaded(records: Vec<Record>) -> Bucket {
        let length = 4 + records.iter().map(Record::size).sum::<usize>();
        Bucket {
            info: None,
            length,
            records: Some(records),
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_loaded(&self) -> bool {
        self.records.is_some()
    }

    /// First key, from memory or the descriptor.
    pub fn first_key(&self) -> &[u8] {
        match &self.records {
            Some(records) => &records[0].key,
            None => {
                &self
                    .info
                    .as_ref()
                    .expect("unloaded bucket always has a descriptor")
                    .first_key
            }
        }
    }

    /// Payload encoding: record count, then length-prefixed keys/values.
    pub fn encode(&self) -> Vec<u8> {
        let records = self.records.as_ref().expect("cannot encode an unloaded bucket");
        let mut out = Vec::with_capacity(self.length);
        out.extend_from_slice(&(records.len() as u32).to_le_bytes());
        for rec in records {
            out.extend_from_slice(&(rec.key.len() as u32).to_le_bytes());
            out.extend_from_slice(&rec.key);
            out.extend_from_slice(&(rec.value.len() as u32).to_le_bytes());
            out.extend_from_slice(&rec.value);
        }
        debug_assert_eq!(out.len(), self.length);
        out
    }

    /// Installs decoded contents into an unloaded bucket.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<()> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let count = cursor.read_u32()? as usize;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let key = cursor.read_slice()?.to_vec();
            let value = cursor.read_slice()?.to_vec();
            records.push(Record { key, value });
        }
        self.length = 4 + records.iter().map(Record::size).sum::<usize>();
        self.records = Some(records);
        Ok(())
    }
}

/// The sorted record set of one leaf, partitioned into buckets.
#[derive(Debug)]
pub struct RecordBuckets {
    max_bucket_length: usize,
    buckets: Vec<Bucket>,
    /// Total payload length across buckets.
    length: usize,
    /// Total record count across loaded buckets.
    count: usize,
}

impl RecordBuckets {
    pub fn new(max_bucket_length: usize) -> RecordBuckets {
        RecordBuckets {
            max_bucket_length,
            buckets: Vec::new(),
            length: 0,
            count: 0,
        }
    }

    pub fn buckets_number(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, idx: usize) -> &Bucket {
        &self.buckets[idx]
    }

    pub fn bucket_mut(&mut self, idx: usize) -> &mut Bucket {
        &mut self.buckets[idx]
    }

    /// Total payload bytes, the leaf's size driver.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Total records.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.buckets.iter().all(Bucket::is_loaded)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.buckets
            .iter()
            .filter_map(|b| b.records.as_ref())
            .flatten()
    }

    /// Appends `rec` in key order: callers feed records sorted. Extends the
    /// last bucket while it stays within the cap, else opens a new one.
    pub fn push_back(&mut self, rec: Record) {
        let rec_size = rec.size();
        let open_new = match self.buckets.last() {
            Some(last) => last.length + rec_size > self.max_bucket_length,
            None => true,
        };
        if open_new {
            self.buckets.push(Bucket::loaded(Vec::new()));
        }

        let last = self.buckets.last_mut().unwrap();
        last.records.as_mut().unwrap().push(rec);
        last.length += rec_size;
        if last.records.as_ref().unwrap().len() == 1 {
            self.length += 4;
        }
        self.length += rec_size;
        self.count += 1;
    }

    /// Takes every record, leaving the container empty. All buckets must
    /// be loaded.
    pub fn take_records(&mut self) -> Vec<Record> {
        debug_assert!(self.is_fully_loaded());
        let mut out = Vec::with_capacity(self.count);
        for bucket in self.buckets.drain(..) {
            out.extend(bucket.records.expect("bucket is loaded"));
        }
        self.length = 0;
        self.count = 0;
        out
    }

    /// Installs deserialized skeleton state: descriptors without contents.
    pub fn install_shells(&mut self, infos: Vec<BucketInfo>) {
        debug_assert!(self.buckets.is_empty());
        self.count = 0;
        self.length = infos.iter().map(|i| i.uncompressed as usize).sum();
        self.buckets = infos
            .into_iter()
            .map(|info| Bucket {
                length: info.uncompressed as usize,
                info: Some(info),
                records: None,
            })
            .collect();
    }

    /// Account for a bucket load: the payload length was already counted
    /// from the descriptor, the records were not.
    pub fn note_bucket_loaded(&mut self, idx: usize) {
        self.count += self.buckets[idx]
            .records
            .as_ref()
            .map(|r| r.len())
            .unwrap_or(0);
    }

    /// Moves the upper half into `other` and returns the promoted
    /// separator: the first key of the right side. A single bucket splits
    /// record-wise, several buckets split bucket-wise.
    pub fn split(&mut self, other: &mut RecordBuckets) -> Vec<u8> {
        debug_assert!(other.buckets.is_empty());
        debug_assert!(!self.buckets.is_empty());
        debug_assert!(self.is_fully_loaded());

        if self.buckets.len() == 1 {
            let records = self.buckets[0].records.as_mut().unwrap();
            let upper = records.split_off(records.len() / 2);
            let lower = std::mem::take(records);

            *self = {
                let mut fresh = RecordBuckets::new(self.max_bucket_length);
                for rec in lower {
                    fresh.push_back(rec);
                }
                fresh
            };
            for rec in upper {
                other.push_back(rec);
            }
        } else {
            let at = self.buckets.len() / 2;
            let moved = self.buckets.split_off(at);
            for bucket in &moved {
                self.length -= bucket.length;
                self.count -= bucket.records.as_ref().unwrap().len();
            }
            other.buckets = moved;
            other.length = other.buckets.iter().map(|b| b.length).sum();
            other.count = other
                .buckets
                .iter()
                .map(|b| b.records.as_ref().unwrap().len())
                .sum();
        }

        debug_assert!(other.buckets_number() > 0);
        other.buckets[0].records.as_ref().unwrap()[0].key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(key: &str, value_len: usize) -> Record {
        Record::new(key.as_bytes().to_vec(), vec![b'v'; value_len])
    }

    fn filled(max: usize, n: usize, value_len: usize) -> RecordBuckets {
        let mut buckets = RecordBuckets::new(max);
        for i in 0..n {
            buckets.push_back(rec(&format!("key{:04}", i), value_len));
        }
        buckets
    }

    #[test]
    fn record_size_formula() {
        assert_eq!(rec("abc", 5).size(), 4 + 3 + 4 + 5);
    }

    #[test]
    fn push_back_partitions_by_size() {
        // Each record is 4+7+4+20 = 35 bytes; cap of 80 fits two per
        // bucket (4 + 70 = 74).
        let buckets = filled(80, 5, 20);

        assert_eq!(buckets.buckets_number(), 3);
        assert_eq!(buckets.count(), 5);
        assert_eq!(buckets.bucket(0).records.as_ref().unwrap().len(), 2);
        assert_eq!(buckets.bucket(2).records.as_ref().unwrap().len(), 1);
        assert_eq!(buckets.length(), 3 * 4 + 5 * 35);
    }

    #[test]
    fn oversized_record_gets_its_own_bucket() {
        let mut buckets = RecordBuckets::new(64);
        buckets.push_back(rec("small", 4));
        buckets.push_back(rec("huge", 500));
        buckets.push_back(rec("tiny", 1));

        assert_eq!(buckets.buckets_number(), 3);
        assert_eq!(buckets.bucket(1).length(), 4 + 4 + 4 + 4 + 500);
    }

    #[test]
    fn single_bucket_splits_record_wise() {
        let mut left = filled(1 << 20, 10, 8);
        let mut right = RecordBuckets::new(1 << 20);

        let promoted = left.split(&mut right);

        assert_eq!(promoted, b"key0005".to_vec());
        assert_eq!(left.count(), 5);
        assert_eq!(right.count(), 5);
        assert_eq!(left.iter().last().unwrap().key, b"key0004".to_vec());
        assert_eq!(right.iter().next().unwrap().key, b"key0005".to_vec());
    }

    #[test]
    fn multi_bucket_splits_bucket_wise() {
        let mut left = filled(80, 8, 20); // 4 buckets of 2
        let before_len = left.length();
        let mut right = RecordBuckets::new(80);

        let promoted = left.split(&mut right);

        assert_eq!(left.buckets_number(), 2);
        assert_eq!(right.buckets_number(), 2);
        assert_eq!(promoted, right.iter().next().unwrap().key);
        assert_eq!(left.length() + right.length(), before_len);
        assert_eq!(left.count() + right.count(), 8);
    }

    #[test]
    fn take_records_drains_in_order() {
        let mut buckets = filled(80, 6, 20);
        let records = buckets.take_records();

        assert_eq!(records.len(), 6);
        assert!(records.windows(2).all(|w| w[0].key < w[1].key));
        assert_eq!(buckets.count(), 0);
        assert_eq!(buckets.length(), 0);
        assert_eq!(buckets.buckets_number(), 0);
    }

    #[test]
    fn bucket_encode_decode_round_trips() {
        let buckets = filled(1 << 20, 3, 16);
        let bytes = buckets.bucket(0).encode();

        let mut shell = Bucket {
            info: None,
            length: 0,
            records: None,
        };
        shell.decode(&bytes).unwrap();

        assert_eq!(shell.records.as_ref().unwrap().len(), 3);
        assert_eq!(shell.length(), buckets.bucket(0).length());
        assert_eq!(shell.first_key(), b"key0000");
    }

    #[test]
    fn install_shells_accounts_length_without_contents() {
        let mut buckets = RecordBuckets::new(1024);
        buckets.install_shells(vec![
            BucketInfo {
                first_key: b"a".to_vec(),
                offset: 64,
                length: 100,
                uncompressed: 120,
                crc: 1,
            },
            BucketInfo {
                first_key: b"m".to_vec(),
                offset: 164,
                length: 80,
                uncompressed: 90,
                crc: 2,
            },
        ]);

        assert_eq!(buckets.buckets_number(), 2);
        assert!(!buckets.is_fully_loaded());
        assert_eq!(buckets.length(), 210);
        assert_eq!(buckets.count(), 0);
        assert_eq!(buckets.bucket(1).first_key(), b"m");
    }
}
