use crate::errors::EncodeError;

/// Kind of a field's aggregate.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FieldKind {
    /// Sum of observed values.
    Sum,

    /// Minimum observed value.
    Min,

    /// Maximum observed value.
    Max,

    /// First observed value.
    First,

    /// Last observed value.
    Last,

    /// Bucketed distribution of observed values.
    Histogram,
}

/// A histogram descriptor.
///
/// Bucket `i` counts the observations less than or equal to `upper_bounds[i]`. The final bound may be `+Inf`.
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    min: f64,
    max: f64,
    sum: f64,
    count: f64,
    upper_bounds: Vec<f64>,
    bucket_counts: Vec<f64>,
}

impl Histogram {
    /// Creates a new histogram.
    ///
    /// The histogram is not checked here: malformed histograms are rejected when the point carrying them is encoded.
    pub fn new(min: f64, max: f64, sum: f64, count: f64, upper_bounds: Vec<f64>, bucket_counts: Vec<f64>) -> Self {
        Self {
            min,
            max,
            sum,
            count,
            upper_bounds,
            bucket_counts,
        }
    }

    /// Returns the smallest observed value.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Returns the largest observed value.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Returns the sum of observed values.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Returns the number of observed values.
    pub fn count(&self) -> f64 {
        self.count
    }

    /// Returns the bucket upper bounds.
    pub fn upper_bounds(&self) -> &[f64] {
        &self.upper_bounds
    }

    /// Returns the bucket counts.
    pub fn bucket_counts(&self) -> &[f64] {
        &self.bucket_counts
    }

    fn validate(&self, field: &str) -> Result<(), EncodeError> {
        let malformed = |reason| EncodeError::MalformedHistogram {
            field: field.to_string(),
            reason,
        };

        if self.upper_bounds.len() != self.bucket_counts.len() {
            return Err(malformed("bucket bounds and bucket counts differ in length"));
        }
        if ![self.min, self.max, self.sum, self.count].iter().all(|v| v.is_finite()) {
            return Err(malformed("min, max, sum and count must be finite"));
        }
        if self.min < 0.0 {
            return Err(malformed("min must not be negative"));
        }
        if self.min > self.max {
            return Err(malformed("min exceeds max"));
        }
        if self.upper_bounds.iter().any(|b| b.is_nan()) {
            return Err(malformed("bucket bounds must not be NaN"));
        }
        if !self.bucket_counts.iter().all(|c| c.is_finite() && *c >= 0.0) {
            return Err(malformed("bucket counts must be finite and non-negative"));
        }

        Ok(())
    }
}

/// The value carried by a field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// A simple aggregate.
    Simple(FieldKind, f64),

    /// A histogram.
    Histogram(Histogram),
}

/// A named aggregate within a point.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    name: String,
    value: FieldValue,
}

impl Field {
    fn simple<S: Into<String>>(name: S, kind: FieldKind, value: f64) -> Self {
        Self {
            name: name.into(),
            value: FieldValue::Simple(kind, value),
        }
    }

    /// Creates a sum field.
    pub fn sum<S: Into<String>>(name: S, value: f64) -> Self {
        Self::simple(name, FieldKind::Sum, value)
    }

    /// Creates a min field.
    pub fn min<S: Into<String>>(name: S, value: f64) -> Self {
        Self::simple(name, FieldKind::Min, value)
    }

    /// Creates a max field.
    pub fn max<S: Into<String>>(name: S, value: f64) -> Self {
        Self::simple(name, FieldKind::Max, value)
    }

    /// Creates a first-value field.
    pub fn first<S: Into<String>>(name: S, value: f64) -> Self {
        Self::simple(name, FieldKind::First, value)
    }

    /// Creates a last-value field.
    pub fn last<S: Into<String>>(name: S, value: f64) -> Self {
        Self::simple(name, FieldKind::Last, value)
    }

    /// Creates a histogram field.
    pub fn histogram<S: Into<String>>(name: S, histogram: Histogram) -> Self {
        Self {
            name: name.into(),
            value: FieldValue::Histogram(histogram),
        }
    }

    /// Returns the field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the field kind.
    pub fn kind(&self) -> FieldKind {
        match &self.value {
            FieldValue::Simple(kind, _) => *kind,
            FieldValue::Histogram(_) => FieldKind::Histogram,
        }
    }

    /// Returns the field value.
    pub fn value(&self) -> &FieldValue {
        &self.value
    }

    /// Checks that the field can be encoded.
    ///
    /// # Errors
    ///
    /// If a simple value is not finite, or a histogram is malformed, an error is returned.
    pub fn validate(&self) -> Result<(), EncodeError> {
        match &self.value {
            FieldValue::Simple(_, value) if !value.is_finite() => Err(EncodeError::NonFiniteValue {
                field: self.name.clone(),
            }),
            FieldValue::Simple(..) => Ok(()),
            FieldValue::Histogram(histogram) => histogram.validate(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_fields() {
        for field in [
            Field::sum("sum", 10.0),
            Field::min("min", 10.0),
            Field::max("max", 10.0),
            Field::first("first", 10.0),
            Field::last("last", 10.0),
        ] {
            assert!(field.validate().is_ok(), "{} should be valid", field.name());
        }

        assert_eq!(Field::first("f", 1.0).kind(), FieldKind::First);
        assert!(matches!(
            Field::sum("bad", f64::INFINITY).validate(),
            Err(EncodeError::NonFiniteValue { .. })
        ));
        assert!(Field::last("bad", f64::NAN).validate().is_err());
    }

    #[test]
    fn histogram_fields() {
        let valid = Histogram::new(1.0, 10.0, 100.0, 20.0, vec![1.0, 2.0, f64::INFINITY], vec![1.0, 2.0, 3.0]);
        assert!(Field::histogram("h", valid).validate().is_ok());

        let mismatched = Histogram::new(1.0, 10.0, 100.0, 20.0, vec![1.0, 2.0, 3.0, 4.0], vec![1.0, 2.0, 3.0]);
        assert!(Field::histogram("h", mismatched).validate().is_err());

        let negative_min = Histogram::new(-1.0, 10.0, 100.0, 20.0, vec![1.0, 2.0, 3.0], vec![1.0, 2.0, 3.0]);
        assert!(Field::histogram("h", negative_min).validate().is_err());

        let inverted = Histogram::new(11.0, 10.0, 100.0, 20.0, vec![1.0], vec![1.0]);
        let err = Field::histogram("h", inverted).validate().unwrap_err();
        assert_eq!(err.to_string(), "histogram field 'h' is malformed: min exceeds max");
    }
}
