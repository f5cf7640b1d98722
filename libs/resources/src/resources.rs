//! Resource bundles and their componentwise arithmetic.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::error::ResourceError;
use crate::value::{Ranges, Value, ValueKind};

/// A single named, typed resource quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub value: Value,
}

impl Resource {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Shorthand for a scalar resource.
    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, Value::Scalar(value))
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.value)
    }
}

/// A multiset-like bundle of resources, canonical at all times: one
/// component per (name, kind), sorted by name then kind, empty
/// components dropped. Negative scalars are representable (bundle
/// subtraction does not clamp); ranges and sets saturate at empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(Vec<Resource>);

impl Resources {
    /// The empty bundle.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a canonical bundle from arbitrary components, merging
    /// duplicates componentwise.
    pub fn new(resources: impl IntoIterator<Item = Resource>) -> Self {
        let mut bundle = Self::empty();
        for resource in resources {
            bundle.absorb(resource);
        }
        bundle
    }

    /// Parses the textual form, e.g.
    /// `cpus:8;mem:16384;ports:[31000-32000];disks:{sda1,sda2}`.
    ///
    /// Scalars must be non-negative; intervals must be ordered.
    pub fn parse(input: &str) -> Result<Self, ResourceError> {
        let mut bundle = Self::empty();

        for segment in input.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }

            let Some((name, value)) = segment.split_once(':') else {
                return Err(ResourceError::parse(segment, "expected name:value"));
            };
            let name = name.trim();
            let value = value.trim();
            if name.is_empty() {
                return Err(ResourceError::parse(segment, "empty resource name"));
            }

            let value = if let Some(body) = value.strip_prefix('[') {
                let Some(body) = body.strip_suffix(']') else {
                    return Err(ResourceError::parse(segment, "unterminated range"));
                };
                Value::Ranges(parse_ranges(segment, body)?)
            } else if let Some(body) = value.strip_prefix('{') {
                let Some(body) = body.strip_suffix('}') else {
                    return Err(ResourceError::parse(segment, "unterminated set"));
                };
                let items: BTreeSet<String> = body
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect();
                Value::Set(items)
            } else {
                let scalar: f64 = value
                    .parse()
                    .map_err(|_| ResourceError::parse(segment, "expected a number"))?;
                if !scalar.is_finite() || scalar < 0.0 {
                    return Err(ResourceError::parse(
                        segment,
                        "scalar resources must be finite and non-negative",
                    ));
                }
                Value::Scalar(scalar)
            };

            bundle.absorb(Resource::new(name, value));
        }

        Ok(bundle)
    }

    /// Returns true if the bundle has no components.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over the constituent resources.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.0.iter()
    }

    /// Looks up the value with the given name. If the bundle carries
    /// several kinds under one name, the scalar wins.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0
            .iter()
            .filter(|resource| resource.name == name)
            .min_by_key(|resource| resource.value.kind())
            .map(|resource| &resource.value)
    }

    /// The scalar amount under `name`, if any.
    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.0
            .iter()
            .find(|r| r.name == name && r.value.kind() == ValueKind::Scalar)
            .and_then(|r| r.value.as_scalar())
    }

    /// Returns true if `other` is componentwise contained in `self`.
    pub fn contains(&self, other: &Resources) -> bool {
        other.0.iter().all(|needed| {
            let have = self
                .0
                .iter()
                .find(|r| r.name == needed.name && r.value.kind() == needed.value.kind());
            match (have, &needed.value) {
                (Some(have), Value::Scalar(needed)) => {
                    have.value.as_scalar().is_some_and(|have| have >= *needed)
                }
                (Some(have), Value::Ranges(needed)) => match &have.value {
                    Value::Ranges(have) => have.contains(needed),
                    _ => false,
                },
                (Some(have), Value::Set(needed)) => match &have.value {
                    Value::Set(have) => needed.is_subset(have),
                    _ => false,
                },
                (None, _) => needed.value.is_empty(),
            }
        })
    }

    /// Subtracts `other`, failing without mutation if any component
    /// would underflow (scalar going negative, range or set not
    /// contained).
    pub fn checked_sub(&self, other: &Resources) -> Result<Resources, ResourceError> {
        if !self.contains(other) {
            let name = other
                .0
                .iter()
                .find(|needed| {
                    !self.contains(&Resources(vec![(*needed).clone()]))
                })
                .map(|r| r.name.clone())
                .unwrap_or_default();
            return Err(ResourceError::Underflow {
                name,
                minuend: self.to_string(),
                subtrahend: other.to_string(),
            });
        }
        Ok(self.clone() - other.clone())
    }

    // Merge one component into the canonical vector.
    fn absorb(&mut self, resource: Resource) {
        if let Some(existing) = self
            .0
            .iter_mut()
            .find(|r| r.name == resource.name && r.value.kind() == resource.value.kind())
        {
            match (&mut existing.value, resource.value) {
                (Value::Scalar(a), Value::Scalar(b)) => *a += b,
                (Value::Ranges(a), Value::Ranges(b)) => *a = a.union(&b),
                (Value::Set(a), Value::Set(b)) => a.extend(b),
                _ => unreachable!("kind-matched above"),
            }
        } else {
            self.0.push(resource);
        }
        self.canonicalise();
    }

    fn subtract(&mut self, resource: &Resource) {
        if let Some(existing) = self
            .0
            .iter_mut()
            .find(|r| r.name == resource.name && r.value.kind() == resource.value.kind())
        {
            match (&mut existing.value, &resource.value) {
                (Value::Scalar(a), Value::Scalar(b)) => *a -= b,
                (Value::Ranges(a), Value::Ranges(b)) => *a = a.subtract(b),
                (Value::Set(a), Value::Set(b)) => {
                    a.retain(|item| !b.contains(item));
                }
                _ => unreachable!("kind-matched above"),
            }
        } else if let Value::Scalar(b) = resource.value {
            // Subtracting a scalar that is not present leaves a deficit.
            if b != 0.0 {
                self.0.push(Resource::scalar(resource.name.clone(), -b));
            }
        }
        self.canonicalise();
    }

    fn canonicalise(&mut self) {
        self.0.retain(|resource| !resource.value.is_empty());
        self.0
            .sort_by(|a, b| (a.name.as_str(), a.value.kind()).cmp(&(b.name.as_str(), b.value.kind())));
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, resource) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            write!(f, "{}", resource)?;
        }
        Ok(())
    }
}

impl FromIterator<Resource> for Resources {
    fn from_iter<T: IntoIterator<Item = Resource>>(iter: T) -> Self {
        Self::new(iter)
    }
}

impl<'a> IntoIterator for &'a Resources {
    type Item = &'a Resource;
    type IntoIter = std::slice::Iter<'a, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl AddAssign<&Resources> for Resources {
    fn add_assign(&mut self, rhs: &Resources) {
        for resource in &rhs.0 {
            self.absorb(resource.clone());
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        *self += &rhs;
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(mut self, rhs: Resources) -> Resources {
        self += &rhs;
        self
    }
}

impl Add<&Resources> for Resources {
    type Output = Resources;

    fn add(mut self, rhs: &Resources) -> Resources {
        self += rhs;
        self
    }
}

impl SubAssign<&Resources> for Resources {
    fn sub_assign(&mut self, rhs: &Resources) {
        for resource in &rhs.0 {
            self.subtract(resource);
        }
    }
}

impl SubAssign for Resources {
    fn sub_assign(&mut self, rhs: Resources) {
        *self -= &rhs;
    }
}

impl Sub for Resources {
    type Output = Resources;

    fn sub(mut self, rhs: Resources) -> Resources {
        self -= &rhs;
        self
    }
}

impl Sub<&Resources> for Resources {
    type Output = Resources;

    fn sub(mut self, rhs: &Resources) -> Resources {
        self -= rhs;
        self
    }
}

fn parse_ranges(segment: &str, body: &str) -> Result<Ranges, ResourceError> {
    let mut intervals = Vec::new();
    for part in body.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((begin, end)) = part.split_once('-') else {
            return Err(ResourceError::parse(segment, "expected begin-end"));
        };
        let begin: u64 = begin
            .trim()
            .parse()
            .map_err(|_| ResourceError::parse(segment, "range bounds must be integers"))?;
        let end: u64 = end
            .trim()
            .parse()
            .map_err(|_| ResourceError::parse(segment, "range bounds must be integers"))?;
        if begin > end {
            return Err(ResourceError::parse(segment, "range begin exceeds end"));
        }
        intervals.push((begin, end));
    }
    Ok(Ranges::new(intervals))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Resources {
        Resources::parse(s).unwrap()
    }

    #[test]
    fn test_parse_scalars() {
        let r = parse("cpus:10;mem:1000");
        assert_eq!(r.scalar("cpus"), Some(10.0));
        assert_eq!(r.scalar("mem"), Some(1000.0));
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_parse_mixed() {
        let r = parse("cpus:4; ports:[31000-32000,5000-5001]; disks:{sda1,sda2}");
        assert_eq!(r.scalar("cpus"), Some(4.0));
        match r.get("ports").unwrap() {
            Value::Ranges(ranges) => {
                assert_eq!(ranges.intervals(), &[(5000, 5001), (31000, 32000)])
            }
            other => panic!("unexpected value: {other:?}"),
        }
        match r.get("disks").unwrap() {
            Value::Set(set) => assert_eq!(set.len(), 2),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse("").is_empty());
        assert!(parse(" ; ; ").is_empty());
    }

    #[test]
    fn test_parse_rejects_negative_scalar() {
        assert!(Resources::parse("cpus:-1").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Resources::parse("cpus").is_err());
        assert!(Resources::parse("ports:[1-").is_err());
        assert!(Resources::parse("ports:[2-1]").is_err());
        assert!(Resources::parse("cpus:abc").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let r = parse("cpus:2.5;disks:{a,b};mem:100;ports:[1-10]");
        assert_eq!(parse(&r.to_string()), r);
    }

    #[test]
    fn test_addition_merges_components() {
        let sum = parse("cpus:2;mem:100") + parse("cpus:3;ports:[1-5]");
        assert_eq!(sum, parse("cpus:5;mem:100;ports:[1-5]"));
    }

    #[test]
    fn test_addition_commutative() {
        let a = parse("cpus:2;ports:[1-10];disks:{x}");
        let b = parse("cpus:3;ports:[5-20];disks:{y}");
        assert_eq!(a.clone() + b.clone(), b + a);
    }

    #[test]
    fn test_addition_associative() {
        let a = parse("cpus:1");
        let b = parse("cpus:2;mem:5");
        let c = parse("mem:7;ports:[1-2]");
        assert_eq!(
            (a.clone() + b.clone()) + c.clone(),
            a + (b + c)
        );
    }

    #[test]
    fn test_self_subtraction_is_empty() {
        let r = parse("cpus:2;mem:100;ports:[1-10];disks:{a,b}");
        assert!((r.clone() - r).is_empty());
    }

    #[test]
    fn test_scalar_subtraction_goes_negative() {
        let pool = parse("cpus:2") - parse("cpus:5");
        assert_eq!(pool.scalar("cpus"), Some(-3.0));
    }

    #[test]
    fn test_subtracting_absent_scalar_leaves_deficit() {
        let pool = Resources::empty() - parse("mem:100");
        assert_eq!(pool.scalar("mem"), Some(-100.0));
    }

    #[test]
    fn test_range_subtraction_saturates() {
        let left = parse("ports:[1-10]") - parse("ports:[1-100]");
        assert!(left.is_empty());
    }

    #[test]
    fn test_contains() {
        let pool = parse("cpus:4;mem:1000;ports:[1-100]");
        assert!(pool.contains(&parse("cpus:2;ports:[5-10]")));
        assert!(pool.contains(&Resources::empty()));
        assert!(!pool.contains(&parse("cpus:5")));
        assert!(!pool.contains(&parse("disks:{a}")));
        assert!(!pool.contains(&parse("ports:[90-110]")));
    }

    #[test]
    fn test_checked_sub_underflow() {
        let pool = parse("cpus:1");
        let err = pool.checked_sub(&parse("cpus:2")).unwrap_err();
        assert!(matches!(err, ResourceError::Underflow { ref name, .. } if name == "cpus"));
        // No mutation on failure.
        assert_eq!(pool.scalar("cpus"), Some(1.0));
    }

    #[test]
    fn test_checked_sub_ok() {
        let pool = parse("cpus:4;ports:[1-10]");
        let rest = pool.checked_sub(&parse("cpus:1;ports:[1-2]")).unwrap();
        assert_eq!(rest, parse("cpus:3;ports:[3-10]"));
    }

    #[test]
    fn test_equality_is_canonical() {
        let a = parse("mem:100;cpus:2");
        let b = parse("cpus:2;mem:100");
        assert_eq!(a, b);
    }

    #[test]
    fn test_json_roundtrip() {
        let r = parse("cpus:2;ports:[1-10];disks:{a}");
        let json = serde_json::to_string(&r).unwrap();
        let back: Resources = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
