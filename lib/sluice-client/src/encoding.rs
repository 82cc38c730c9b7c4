//! Batch encoding.
//!
//! A batch is a protobuf `WriteBatch` message: the target database followed by one `MetricRecord` per point. Points
//! are streamed into the batch one at a time as length-delimited `metrics` entries, so an in-progress batch is never
//! held as a list of points, only as its encoded bytes.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use prost::Message as _;
use snafu::ResultExt as _;

use crate::{
    errors::{Decode, EncodeError},
    model::{Field, FieldKind, FieldValue, Histogram, Point, DEFAULT_NAMESPACE},
};

/// Protobuf messages for the batch wire format.
pub mod proto {
    use std::collections::BTreeMap;

    /// A batch of metric records bound for a single database.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct WriteBatch {
        /// Target database.
        #[prost(string, tag = "1")]
        pub database: String,

        /// Records, in arrival order.
        #[prost(message, repeated, tag = "2")]
        pub metrics: Vec<MetricRecord>,
    }

    /// A single point.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct MetricRecord {
        #[prost(string, tag = "1")]
        pub namespace: String,

        #[prost(string, tag = "2")]
        pub name: String,

        /// Milliseconds since the Unix epoch.
        #[prost(int64, tag = "3")]
        pub timestamp: i64,

        #[prost(btree_map = "string, string", tag = "4")]
        pub tags: BTreeMap<String, String>,

        #[prost(message, repeated, tag = "5")]
        pub fields: Vec<FieldRecord>,
    }

    /// A single field.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FieldRecord {
        #[prost(string, tag = "1")]
        pub name: String,

        #[prost(enumeration = "FieldType", tag = "2")]
        pub kind: i32,

        /// Value of a simple field. Unset for histograms.
        #[prost(double, tag = "3")]
        pub value: f64,

        /// Set only for histograms.
        #[prost(message, optional, tag = "4")]
        pub histogram: Option<HistogramRecord>,
    }

    /// A histogram descriptor.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct HistogramRecord {
        #[prost(double, tag = "1")]
        pub min: f64,

        #[prost(double, tag = "2")]
        pub max: f64,

        #[prost(double, tag = "3")]
        pub sum: f64,

        #[prost(double, tag = "4")]
        pub count: f64,

        #[prost(double, repeated, tag = "5")]
        pub upper_bounds: Vec<f64>,

        #[prost(double, repeated, tag = "6")]
        pub bucket_counts: Vec<f64>,
    }

    /// Field aggregate type.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum FieldType {
        Unspecified = 0,
        Sum = 1,
        Min = 2,
        Max = 3,
        First = 4,
        Last = 5,
        Histogram = 6,
    }
}

use self::proto::{FieldRecord, FieldType, HistogramRecord, MetricRecord, WriteBatch};

const DATABASE_TAG: u32 = 1;
const METRICS_TAG: u32 = 2;

impl From<FieldKind> for FieldType {
    fn from(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Sum => Self::Sum,
            FieldKind::Min => Self::Min,
            FieldKind::Max => Self::Max,
            FieldKind::First => Self::First,
            FieldKind::Last => Self::Last,
            FieldKind::Histogram => Self::Histogram,
        }
    }
}

/// Streams points into a batch payload.
///
/// Each encoded point is appended to an internal buffer immediately. [`seal`][Self::seal] hands the accumulated bytes
/// out as an immutable payload and resets the encoder for the next batch, reusing the buffer's remaining capacity.
pub struct BatchEncoder {
    database: String,
    default_tags: BTreeMap<String, String>,
    buf: BytesMut,
    scratch: MetricRecord,
    points: usize,
}

impl BatchEncoder {
    /// Creates a new encoder for the given database.
    ///
    /// `default_tags` are merged into every point; tags set on the point itself take precedence.
    pub fn new<S: Into<String>>(database: S, default_tags: BTreeMap<String, String>) -> Self {
        Self {
            database: database.into(),
            default_tags,
            buf: BytesMut::new(),
            scratch: MetricRecord::default(),
            points: 0,
        }
    }

    /// Returns the number of points in the current batch.
    pub fn len(&self) -> usize {
        self.points
    }

    /// Returns `true` if the current batch has no points.
    pub fn is_empty(&self) -> bool {
        self.points == 0
    }

    /// Returns the encoded size of the current batch, in bytes.
    pub fn encoded_len(&self) -> usize {
        self.buf.len()
    }

    /// Encodes a point into the current batch.
    ///
    /// # Errors
    ///
    /// If the point has an empty tag key or value, or any of its fields is invalid, an error is returned and the batch
    /// is left untouched.
    pub fn encode(&mut self, point: &Point) -> Result<(), EncodeError> {
        for (key, value) in self.default_tags.iter().chain(point.tags()) {
            if key.is_empty() {
                return Err(EncodeError::EmptyTagKey);
            }
            if value.is_empty() {
                return Err(EncodeError::EmptyTagValue { key: key.clone() });
            }
        }
        for field in point.fields() {
            field.validate()?;
        }

        let record = &mut self.scratch;
        record.namespace.clear();
        record
            .namespace
            .push_str(point.namespace().unwrap_or(DEFAULT_NAMESPACE));
        record.name.clear();
        record.name.push_str(point.metric_name());
        record.timestamp = point.timestamp_ms();

        record.tags.clone_from(&self.default_tags);
        record
            .tags
            .extend(point.tags().iter().map(|(k, v)| (k.clone(), v.clone())));

        record.fields.clear();
        record.fields.extend(point.fields().iter().map(field_to_record));

        if self.points == 0 && !self.database.is_empty() {
            prost::encoding::string::encode(DATABASE_TAG, &self.database, &mut self.buf);
        }
        prost::encoding::message::encode(METRICS_TAG, &self.scratch, &mut self.buf);
        self.points += 1;

        Ok(())
    }

    /// Seals the current batch, returning its payload.
    ///
    /// Returns `None` if no points were encoded since the last seal.
    pub fn seal(&mut self) -> Option<Bytes> {
        if self.points == 0 {
            return None;
        }

        self.points = 0;
        Some(self.buf.split().freeze())
    }
}

fn field_to_record(field: &Field) -> FieldRecord {
    let kind = FieldType::from(field.kind()) as i32;
    match field.value() {
        FieldValue::Simple(_, value) => FieldRecord {
            name: field.name().to_string(),
            kind,
            value: *value,
            histogram: None,
        },
        FieldValue::Histogram(histogram) => FieldRecord {
            name: field.name().to_string(),
            kind,
            value: 0.0,
            histogram: Some(HistogramRecord {
                min: histogram.min(),
                max: histogram.max(),
                sum: histogram.sum(),
                count: histogram.count(),
                upper_bounds: histogram.upper_bounds().to_vec(),
                bucket_counts: histogram.bucket_counts().to_vec(),
            }),
        },
    }
}

/// A decoded batch.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedBatch {
    /// Target database.
    pub database: String,

    /// Points, in the order they were encoded.
    pub points: Vec<Point>,
}

/// Decodes a serialized batch.
///
/// # Errors
///
/// If the payload is not a valid batch, or a record has an unknown field type or a histogram field without a
/// histogram, an error is returned.
pub fn decode_batch(payload: &[u8]) -> Result<DecodedBatch, EncodeError> {
    let batch = WriteBatch::decode(payload).context(Decode)?;

    let points = batch
        .metrics
        .into_iter()
        .map(record_to_point)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DecodedBatch {
        database: batch.database,
        points,
    })
}

fn record_to_point(record: MetricRecord) -> Result<Point, EncodeError> {
    let mut point = Point::new(record.name)
        .with_namespace(record.namespace)
        .with_timestamp_ms(record.timestamp);
    for (key, value) in record.tags {
        point = point.with_tag(key, value);
    }
    for field in record.fields {
        point = point.with_field(record_to_field(field)?);
    }
    Ok(point)
}

fn record_to_field(record: FieldRecord) -> Result<Field, EncodeError> {
    let kind = FieldType::try_from(record.kind).map_err(|_| EncodeError::MalformedRecord {
        reason: "unknown field type",
    })?;

    let field = match kind {
        FieldType::Unspecified => {
            return Err(EncodeError::MalformedRecord {
                reason: "unspecified field type",
            })
        }
        FieldType::Sum => Field::sum(record.name, record.value),
        FieldType::Min => Field::min(record.name, record.value),
        FieldType::Max => Field::max(record.name, record.value),
        FieldType::First => Field::first(record.name, record.value),
        FieldType::Last => Field::last(record.name, record.value),
        FieldType::Histogram => {
            let h = record.histogram.ok_or(EncodeError::MalformedRecord {
                reason: "histogram field without histogram",
            })?;
            Field::histogram(
                record.name,
                Histogram::new(h.min, h.max, h.sum, h.count, h.upper_bounds, h.bucket_counts),
            )
        }
    };

    Ok(field)
}

#[cfg(test)]
mod tests {
    use proptest::{collection::btree_map, collection::vec as arb_vec, prelude::*};

    use super::*;

    fn point(name: &str) -> Point {
        Point::new(name)
            .with_namespace("ns")
            .with_timestamp_ms(1_700_000_000_000)
            .with_field(Field::sum("value", 1.0))
    }

    #[test]
    fn empty_encoder_seals_to_nothing() {
        let mut encoder = BatchEncoder::new("db", BTreeMap::new());
        assert!(encoder.is_empty());
        assert!(encoder.seal().is_none());
    }

    #[test]
    fn seal_resets_the_batch() {
        let mut encoder = BatchEncoder::new("db", BTreeMap::new());
        encoder.encode(&point("a")).unwrap();
        encoder.encode(&point("b")).unwrap();
        assert_eq!(encoder.len(), 2);

        let first = decode_batch(&encoder.seal().unwrap()).unwrap();
        assert_eq!(first.database, "db");
        assert_eq!(
            first.points.iter().map(Point::metric_name).collect::<Vec<_>>(),
            ["a", "b"]
        );
        assert!(encoder.is_empty());
        assert_eq!(encoder.encoded_len(), 0);

        encoder.encode(&point("c")).unwrap();
        let second = decode_batch(&encoder.seal().unwrap()).unwrap();
        assert_eq!(second.database, "db");
        assert_eq!(second.points, vec![point("c")]);
    }

    #[test]
    fn invalid_point_leaves_batch_untouched() {
        let mut encoder = BatchEncoder::new("db", BTreeMap::new());
        encoder.encode(&point("good")).unwrap();
        let before = encoder.encoded_len();

        let bad_tag = point("bad").with_tag("host", "");
        assert!(matches!(encoder.encode(&bad_tag), Err(EncodeError::EmptyTagValue { .. })));

        let bad_value = point("bad").with_field(Field::max("m", f64::NAN));
        assert!(matches!(encoder.encode(&bad_value), Err(EncodeError::NonFiniteValue { .. })));

        let bad_histogram = point("bad").with_field(Field::histogram(
            "h",
            Histogram::new(1.0, 2.0, 3.0, 4.0, vec![1.0, 2.0], vec![1.0]),
        ));
        assert!(matches!(
            encoder.encode(&bad_histogram),
            Err(EncodeError::MalformedHistogram { .. })
        ));

        assert_eq!(encoder.len(), 1);
        assert_eq!(encoder.encoded_len(), before);
    }

    #[test]
    fn default_tags_and_namespace() {
        let defaults = BTreeMap::from([
            ("region".to_string(), "us-east".to_string()),
            ("host".to_string(), "default-host".to_string()),
        ]);
        let mut encoder = BatchEncoder::new("db", defaults);

        let point = Point::new("cpu")
            .with_tag("host", "web-1")
            .with_field(Field::last("idle", 0.5));
        encoder.encode(&point).unwrap();

        let decoded = decode_batch(&encoder.seal().unwrap()).unwrap();
        let decoded = &decoded.points[0];
        assert_eq!(decoded.namespace(), Some(DEFAULT_NAMESPACE));
        assert_eq!(decoded.tags()["host"], "web-1");
        assert_eq!(decoded.tags()["region"], "us-east");
    }

    #[test]
    fn histogram_survives_encoding() {
        let histogram = Histogram::new(0.5, 9.0, 40.0, 8.0, vec![1.0, 5.0, f64::INFINITY], vec![2.0, 4.0, 2.0]);
        let original = point("latency").with_field(Field::histogram("dist", histogram));

        let mut encoder = BatchEncoder::new("db", BTreeMap::new());
        encoder.encode(&original).unwrap();

        let decoded = decode_batch(&encoder.seal().unwrap()).unwrap();
        assert_eq!(decoded.points, vec![original]);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            decode_batch(&[0x12, 0xff, 0xff]),
            Err(EncodeError::Decode { .. })
        ));
    }

    #[test]
    fn unknown_field_type_is_malformed() {
        let batch = WriteBatch {
            database: "db".into(),
            metrics: vec![MetricRecord {
                namespace: "ns".into(),
                name: "m".into(),
                timestamp: 1,
                tags: BTreeMap::new(),
                fields: vec![FieldRecord {
                    name: "f".into(),
                    kind: 42,
                    value: 1.0,
                    histogram: None,
                }],
            }],
        };

        let err = decode_batch(&batch.encode_to_vec()).unwrap_err();
        assert!(matches!(err, EncodeError::MalformedRecord { .. }));
    }

    fn arb_field() -> impl Strategy<Value = Field> {
        let name = "[a-z]{1,8}";
        let value = -1.0e9..1.0e9f64;
        prop_oneof![
            (name, value.clone()).prop_map(|(n, v)| Field::sum(n, v)),
            (name, value.clone()).prop_map(|(n, v)| Field::min(n, v)),
            (name, value.clone()).prop_map(|(n, v)| Field::max(n, v)),
            (name, value.clone()).prop_map(|(n, v)| Field::first(n, v)),
            (name, value).prop_map(|(n, v)| Field::last(n, v)),
            (name, arb_vec(0.0..1.0e6f64, 0..4)).prop_map(|(n, counts)| {
                let bounds = (1..=counts.len()).map(|i| i as f64).collect();
                Field::histogram(n, Histogram::new(0.0, 10.0, 50.0, 5.0, bounds, counts))
            }),
        ]
    }

    fn arb_point() -> impl Strategy<Value = Point> {
        (
            "[a-z]{1,6}",
            "[a-z_]{1,12}",
            any::<i64>(),
            btree_map("[a-z]{1,6}", "[a-z0-9]{1,6}", 0..4),
            arb_vec(arb_field(), 1..4),
        )
            .prop_map(|(namespace, name, timestamp, tags, fields)| {
                let mut point = Point::new(name).with_namespace(namespace).with_timestamp_ms(timestamp);
                for (k, v) in tags {
                    point = point.with_tag(k, v);
                }
                for field in fields {
                    point = point.with_field(field);
                }
                point
            })
    }

    proptest! {
        #[test]
        fn batch_round_trips(points in arb_vec(arb_point(), 1..16)) {
            let mut encoder = BatchEncoder::new("metrics", BTreeMap::new());
            for point in &points {
                encoder.encode(point).unwrap();
            }

            let decoded = decode_batch(&encoder.seal().unwrap()).unwrap();
            prop_assert_eq!(decoded.database, "metrics");
            prop_assert_eq!(decoded.points, points);
        }
    }
}
