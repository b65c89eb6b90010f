use crate::SchemaError;
use std::fmt;

/// A parsed container image reference: `[domain/]path[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub domain: Option<String>,
    pub path: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self, SchemaError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(SchemaError::InvalidImage(reference.to_owned()));
        }

        let (rest, digest) = match reference.split_once('@') {
            Some((r, d)) if !d.is_empty() => (r, Some(d.to_owned())),
            Some(_) => return Err(SchemaError::InvalidImage(reference.to_owned())),
            None => (reference, None),
        };

        // The tag separator is the last ':' after the final '/', so registry
        // ports (`host:5000/x`) are not mistaken for tags.
        let last_slash = rest.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let tag = &rest[split + 1..];
                if tag.is_empty() {
                    return Err(SchemaError::InvalidImage(reference.to_owned()));
                }
                (&rest[..split], Some(tag.to_owned()))
            }
            None => (rest, None),
        };

        let (domain, path) = match name.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_owned()), remainder.to_owned())
            }
            _ => (None, name.to_owned()),
        };

        if path.is_empty() || path.split('/').any(str::is_empty) {
            return Err(SchemaError::InvalidImage(reference.to_owned()));
        }

        Ok(Self {
            domain,
            path,
            tag,
            digest,
        })
    }

    /// Reference without tag or digest, the unit image tags are grouped under.
    pub fn repository(&self) -> String {
        match &self.domain {
            Some(d) => format!("{d}/{}", self.path),
            None => self.path.clone(),
        }
    }

    /// `repository:tag`, falling back to `default_tag` when none is explicit.
    pub fn tagged(&self, default_tag: &str) -> String {
        format!(
            "{}:{}",
            self.repository(),
            self.tag.as_deref().unwrap_or(default_tag)
        )
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
