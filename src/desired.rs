use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Image reference as written in a compose file: `registry/repo[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageReference {
    pub repository: String,
    pub tag: Option<String>,
    /// `algorithm:hex`, e.g. `sha256:...`
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// Value for the tag variable in `${IMAGE}:${TAG}` interpolation. A digest rides
    /// along as `tag@digest`, which the engine resolves by digest.
    pub fn compose_tag(&self) -> String {
        match &self.digest {
            Some(digest) => format!("{}@{digest}", self.tag_or_latest()),
            None => self.tag_or_latest().to_string(),
        }
    }
}

impl FromStr for ImageReference {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            bail!("Image reference must not be empty");
        }
        if value.chars().any(char::is_whitespace) {
            bail!("Image reference contains whitespace: {value:?}");
        }
        let (name, digest) = match value.split_once('@') {
            Some((name, digest)) => {
                let valid = digest
                    .split_once(':')
                    .is_some_and(|(algo, hex)| !algo.is_empty() && !hex.is_empty());
                if !valid || digest.contains('@') {
                    bail!("Malformed image digest in {value:?} (expected algorithm:hex)");
                }
                (name, Some(digest.to_string()))
            }
            None => (value, None),
        };
        // A colon before the last slash is a registry port, not a tag.
        let last_slash = name.rfind('/').map(|idx| idx + 1).unwrap_or(0);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(rel) => {
                let split = last_slash + rel;
                (&name[..split], Some(&name[split + 1..]))
            }
            None => (name, None),
        };
        if repository.is_empty() || tag.is_some_and(str::is_empty) {
            bail!("Malformed image reference: {value:?}");
        }
        Ok(Self {
            repository: repository.to_string(),
            tag: tag.map(str::to_string),
            digest,
        })
    }
}

impl TryFrom<String> for ImageReference {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ImageReference> for String {
    fn from(value: ImageReference) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// What one run should converge to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRevision {
    pub repo_url: String,
    pub git_ref: Option<String>,
    pub image: Option<ImageReference>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_port_is_not_a_tag() {
        let image: ImageReference = "registry.local:5000/erp/custom".parse().unwrap();
        assert_eq!(image.repository, "registry.local:5000/erp/custom");
        assert_eq!(image.tag, None);
        assert_eq!(image.tag_or_latest(), "latest");

        let image: ImageReference = "registry.local:5000/erp/custom:v15.2".parse().unwrap();
        assert_eq!(image.repository, "registry.local:5000/erp/custom");
        assert_eq!(image.tag.as_deref(), Some("v15.2"));
        assert_eq!(image.to_string(), "registry.local:5000/erp/custom:v15.2");
    }

    #[test]
    fn rejects_empty_and_dangling_tags() {
        assert!("".parse::<ImageReference>().is_err());
        assert!("app:".parse::<ImageReference>().is_err());
        assert!("my app:1".parse::<ImageReference>().is_err());
        assert!("@sha256:abcd".parse::<ImageReference>().is_err());
        assert!("ghcr.io/acme/erp@".parse::<ImageReference>().is_err());
        assert!("ghcr.io/acme/erp@abcd".parse::<ImageReference>().is_err());
    }

    #[test]
    fn digest_is_kept_apart_from_the_repository() {
        let image: ImageReference = "ghcr.io/acme/erp@sha256:abcd".parse().unwrap();
        assert_eq!(image.repository, "ghcr.io/acme/erp");
        assert_eq!(image.tag, None);
        assert_eq!(image.digest.as_deref(), Some("sha256:abcd"));
        assert_eq!(image.compose_tag(), "latest@sha256:abcd");
        assert_eq!(image.to_string(), "ghcr.io/acme/erp@sha256:abcd");

        let image: ImageReference = "registry.local:5000/erp:v2@sha256:abcd".parse().unwrap();
        assert_eq!(image.repository, "registry.local:5000/erp");
        assert_eq!(image.tag.as_deref(), Some("v2"));
        assert_eq!(image.compose_tag(), "v2@sha256:abcd");
        assert_eq!(image.to_string(), "registry.local:5000/erp:v2@sha256:abcd");
    }
}
