//! Image reference normalisation.
//!
//! containerd only accepts fully-qualified references, while users write the
//! short Docker forms (`alpine`, `user/app:v1`). Docker Engine resolves short
//! forms itself and receives the configured string unchanged.

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry host, possibly with port.
    pub registry: String,

    /// Repository path within the registry.
    pub repository: String,

    /// Tag, absent for digest references.
    pub tag: Option<String>,

    /// Content digest (e.g. `sha256:...`).
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse a reference, filling in Docker Hub defaults.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `ghcr.io/org/repo:v1` -> ghcr.io/org/repo:v1
    /// - `localhost:5000/app@sha256:abc` -> localhost:5000/app@sha256:abc
    pub fn parse(image: &str) -> Self {
        let (name_part, digest) = match image.rsplit_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (image, None),
        };

        let (name_part, tag) = match name_part.rsplit_once(':') {
            // A colon followed by a slash belongs to a registry port.
            Some((name, tag)) if !tag.contains('/') => (name, Some(tag.to_string())),
            _ => (name_part, None),
        };

        let (registry, repository) = match name_part.split_once('/') {
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{name_part}")),
            // Docker Hub official images live under `library/`.
            Some((DEFAULT_REGISTRY, rest)) if !rest.contains('/') => {
                (DEFAULT_REGISTRY.to_string(), format!("library/{rest}"))
            }
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name_part.to_string()),
        };

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Self {
            registry,
            repository,
            tag,
            digest,
        }
    }
}

impl ImageRef {
    /// Registry and repository, without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The digest if pinned, otherwise the tag.
    pub fn tag_or_digest(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Expand a short reference to its fully-qualified form.
pub fn normalize(image: &str) -> String {
    ImageRef::parse(image).to_string()
}
