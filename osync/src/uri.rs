//! Storage locations given on the command line
//!
//! Local paths and `file://` URIs are supported. Both ends of a sync are views into one shared
//! [`FileStorage`] rooted at `/`, so copies between them stay on the local filesystem. A location
//! ending with `/` syncs the content of a directory; without it the last path component is a key
//! prefix, e.g. `/data/log` covers `/data/log/a` as well as `/data/log.1`.

use anyhow::{Context, anyhow, bail};
use common::object::{FileStorage, ObjectStorage, WithPrefix};
use std::sync::Arc;

/// Absolute local path of `uri`.
pub fn local_path(uri: &str) -> anyhow::Result<std::path::PathBuf> {
    let path = match uri.strip_prefix("file://") {
        Some(path) if path.starts_with('/') => path,
        Some(_) => bail!("invalid file URI {uri:?}: expected file:///absolute/path"),
        None if uri.contains("://") => {
            let scheme = uri.split("://").next().unwrap_or_default();
            bail!("unsupported storage {scheme:?} in {uri:?}");
        }
        None if uri.is_empty() => bail!("empty storage location"),
        None => uri,
    };
    std::path::absolute(path).with_context(|| format!("invalid path {uri:?}"))
}

/// Key prefix of `uri` within a storage rooted at `/`.
pub fn key_prefix(uri: &str) -> anyhow::Result<String> {
    let path = local_path(uri)?;
    let path = path
        .to_str()
        .ok_or_else(|| anyhow!("path {:?} is not valid UTF-8", path))?;
    let mut prefix = path.trim_start_matches('/').to_string();
    if uri.ends_with('/') && !prefix.is_empty() && !prefix.ends_with('/') {
        prefix.push('/');
    }
    Ok(prefix)
}

/// Source and destination storages for the two command line locations.
///
/// With `follow_links` symlinks are listed as the files they point to; otherwise as links.
pub fn open(
    src: &str,
    dst: &str,
    follow_links: bool,
) -> anyhow::Result<(Arc<dyn ObjectStorage>, Arc<dyn ObjectStorage>)> {
    if src.ends_with('/') != dst.ends_with('/') {
        bail!("SRC and DST should both end with path separator or not: {src:?} {dst:?}");
    }
    let src_prefix = key_prefix(src)?;
    let dst_prefix = key_prefix(dst)?;
    let root: Arc<dyn ObjectStorage> =
        Arc::new(FileStorage::new("/").with_follow_links(follow_links));
    let src: Arc<dyn ObjectStorage> = Arc::new(WithPrefix::new(root.clone(), &src_prefix));
    let dst: Arc<dyn ObjectStorage> = Arc::new(WithPrefix::new(root, &dst_prefix));
    tracing::info!("syncing from {} to {}", src, dst);
    Ok((src, dst))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_keep_the_trailing_separator() {
        assert_eq!(key_prefix("/data/src/").unwrap(), "data/src/");
        assert_eq!(key_prefix("/data/src").unwrap(), "data/src");
        assert_eq!(key_prefix("file:///data/x/").unwrap(), "data/x/");
        assert_eq!(key_prefix("/").unwrap(), "");
        let cwd = std::env::current_dir().unwrap();
        let expected = format!("{}/rel/", cwd.display().to_string().trim_start_matches('/'));
        assert_eq!(key_prefix("rel/").unwrap(), expected);
    }

    #[test]
    fn unsupported_locations() {
        let err = format!("{:#}", open("s3://bucket/", "/tmp/x/", true).unwrap_err());
        assert!(err.contains("unsupported storage"), "{err}");
        assert!(open("file://relative/", "/tmp/x/", true).is_err());
        assert!(open("/tmp/a/", "/tmp/b", true).is_err());
        assert!(open("", "", true).is_err());
    }

    #[test]
    fn both_sides_share_one_storage() {
        let (src, dst) = open("/tmp/a/", "/tmp/b/", true).unwrap();
        let (src_base, src_prefix) = common::object::resolve(&src);
        let (dst_base, dst_prefix) = common::object::resolve(&dst);
        assert!(common::object::same_instance(&src_base, &dst_base));
        assert_eq!(src_prefix, "tmp/a/");
        assert_eq!(dst_prefix, "tmp/b/");
        assert_eq!(src.to_string(), "file:///tmp/a/");
    }
}
