//! Object descriptors and request-to-object resolution.
//!
//! A [`FileObject`] names either a stored object, a derivative of one
//! (carrying the transformation steps that produce it), or a bucket listing
//! (empty key). Derivatives are recognized from per-bucket key patterns or
//! from query parameters; both paths produce a child object whose `parent`
//! is the source it derives from.

use crate::config::Config;
use crate::transform::{OutputFormat, Rotation, TransformStep};
use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;

/// Upper bound on parent-chain length. Configs that nest derivatives deeper
/// than this are rejected at resolution time.
pub const MAX_PARENT_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("parent chain exceeds {MAX_PARENT_DEPTH} levels")]
    ChainTooDeep,

    #[error("bucket '{bucket}': invalid key pattern '{pattern}': {source}")]
    InvalidKeyPattern {
        bucket: String,
        pattern: String,
        source: regex::Error,
    },
}

/// Immutable descriptor of a requested object.
#[derive(Debug, Clone)]
pub struct FileObject {
    /// Stable identifier of the object within its bucket. An empty key
    /// denotes a bucket-listing request.
    pub key: String,
    pub bucket: String,
    /// Transformation steps that produce this object from its parent.
    /// Empty for plain stored objects.
    pub transforms: Vec<TransformStep>,
    pub parent: Option<Box<FileObject>>,
    /// Verify parent existence concurrently with the derivative fetch.
    pub check_parent: bool,
}

impl FileObject {
    /// A plain stored object with no parent.
    pub fn root(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            bucket: bucket.into(),
            transforms: Vec::new(),
            parent: None,
            check_parent: false,
        }
    }

    /// A bucket-listing request.
    pub fn listing(bucket: impl Into<String>) -> Self {
        Self::root(bucket, "")
    }

    /// A derivative of `parent` produced by `transforms`.
    pub fn derivative(
        bucket: impl Into<String>,
        key: impl Into<String>,
        transforms: Vec<TransformStep>,
        parent: FileObject,
        check_parent: bool,
    ) -> Result<Self, ObjectError> {
        if parent.depth() + 1 > MAX_PARENT_DEPTH {
            return Err(ObjectError::ChainTooDeep);
        }
        Ok(Self {
            key: key.into(),
            bucket: bucket.into(),
            transforms,
            parent: Some(Box::new(parent)),
            check_parent,
        })
    }

    pub fn has_transform(&self) -> bool {
        !self.transforms.is_empty()
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    pub fn is_listing(&self) -> bool {
        self.key.is_empty()
    }

    /// Number of ancestors above this object.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Some(parent) = current.parent.as_deref() {
            depth += 1;
            current = parent;
        }
        depth
    }
}

/// Compiled per-bucket resolution rules.
pub struct BucketRouter {
    buckets: HashMap<String, BucketRules>,
}

struct BucketRules {
    patterns: Vec<Regex>,
    check_parent: bool,
}

impl BucketRouter {
    /// Compiles the key patterns of every configured bucket.
    pub fn from_config(config: &Config) -> Result<Self, ObjectError> {
        let mut buckets = HashMap::new();
        for (name, bucket) in &config.buckets {
            let mut patterns = Vec::with_capacity(bucket.keys.len());
            for rule in &bucket.keys {
                let pattern =
                    Regex::new(&rule.path).map_err(|source| ObjectError::InvalidKeyPattern {
                        bucket: name.clone(),
                        pattern: rule.path.clone(),
                        source,
                    })?;
                patterns.push(pattern);
            }
            buckets.insert(
                name.clone(),
                BucketRules {
                    patterns,
                    check_parent: bucket.check_parent,
                },
            );
        }
        Ok(Self { buckets })
    }

    /// Resolves a request path and query into an object descriptor.
    ///
    /// Resolution order: bucket listing (empty key), then key presets
    /// (first matching pattern wins), then query-parameter transforms,
    /// then a plain stored object.
    pub fn resolve(
        &self,
        bucket: &str,
        key: &str,
        query: &HashMap<String, String>,
    ) -> Result<FileObject, ObjectError> {
        if key.is_empty() {
            return Ok(FileObject::listing(bucket));
        }

        let rules = self.buckets.get(bucket);
        let check_parent = rules.map(|r| r.check_parent).unwrap_or(false);

        if let Some(rules) = rules {
            for pattern in &rules.patterns {
                let Some(captures) = pattern.captures(key) else {
                    continue;
                };
                let Some(parent_key) = captures.name("parent") else {
                    continue;
                };
                let steps =
                    steps_from(|name| captures.name(name).map(|m| m.as_str().to_string()));
                if steps.is_empty() {
                    continue;
                }
                let parent = FileObject::root(bucket, parent_key.as_str());
                return FileObject::derivative(bucket, key, steps, parent, check_parent);
            }
        }

        let steps = steps_from(|name| query.get(name).cloned());
        if !steps.is_empty() {
            let derived_key = query_key(key, &steps);
            let parent = FileObject::root(bucket, key);
            return FileObject::derivative(bucket, derived_key, steps, parent, check_parent);
        }

        Ok(FileObject::root(bucket, key))
    }
}

/// Builds transformation steps from named values (regex captures or query
/// parameters). Unparsable values are ignored rather than rejected.
fn steps_from(lookup: impl Fn(&str) -> Option<String>) -> Vec<TransformStep> {
    let mut steps = Vec::new();

    let width: Option<u32> = lookup("width").and_then(|v| v.parse().ok());
    let height: Option<u32> = lookup("height").and_then(|v| v.parse().ok());
    if let (Some(width), Some(height)) = (width, height) {
        if width > 0 && height > 0 {
            let crop = lookup("operation").map(|op| op == "crop").unwrap_or(false);
            if crop {
                steps.push(TransformStep::Crop { width, height });
            } else {
                steps.push(TransformStep::Resize { width, height });
            }
        }
    }

    if let Some(format) = lookup("format").and_then(|v| OutputFormat::from_name(&v)) {
        steps.push(TransformStep::Format(format));
    }

    let grayscale = lookup("grayscale")
        .map(|v| v.is_empty() || v == "true" || v == "1")
        .unwrap_or(false);
    if grayscale {
        steps.push(TransformStep::Grayscale);
    }

    if let Some(rotation) = lookup("rotate")
        .and_then(|v| v.parse().ok())
        .and_then(Rotation::from_degrees)
    {
        steps.push(TransformStep::Rotate(rotation));
    }

    steps
}

/// Stable derivative key for query-driven transforms, so equivalent
/// requests collapse onto one cache entry.
fn query_key(key: &str, steps: &[TransformStep]) -> String {
    let mut tags = Vec::with_capacity(steps.len());
    for step in steps {
        match step {
            TransformStep::Resize { width, height } => tags.push(format!("r{}x{}", width, height)),
            TransformStep::Crop { width, height } => tags.push(format!("c{}x{}", width, height)),
            TransformStep::Format(format) => tags.push(format!("f{}", format.as_str())),
            TransformStep::Grayscale => tags.push("g".to_string()),
            TransformStep::Rotate(rotation) => tags.push(format!("rot{}", rotation.degrees())),
        }
    }
    format!("{}#{}", key, tags.join(","))
}
