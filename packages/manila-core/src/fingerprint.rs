//! Deterministic content hashing of file sets, build configs, and their
//! composition into an artifact's identity.
//!
//! All hashing here is SHA-256 with lowercase hex output (`spec.md` §5.A).
//! This module is stateless: callers are responsible for folding in
//! dependency fingerprints (the engine itself never reads the execution
//! graph).

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::{
    error::EngineError,
    path::{AbsDirPath, AbsFilePath, RelativeTo as _},
    value::BuildConfig,
};

fn hex_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 of a file's bytes, streaming so large files don't need to be
/// buffered in memory (`spec.md` §4.A's `hash_file`).
///
/// Synchronous: `hash_file_set` is itself synchronous (the `SourceSet`
/// materialization feeding it already walked the filesystem synchronously),
/// so there is no async caller to justify an async variant here.
pub fn hash_file(path: &AbsFilePath) -> Result<String, EngineError> {
    let mut file = std::fs::File::open(path.as_std_path())
        .map_err(|err| EngineError::io(path.as_std_path(), err))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|err| EngineError::io(path.as_std_path(), err))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file set: canonicalize each path to a root-relative form, sort
/// lexicographically, then for each compute
/// `SHA-256(file_hash || SHA-256(relative_path))`, concatenate in sorted
/// order, and SHA-256 the concatenation.
///
/// Stable under reordering of the input iterable; the caller (`SourceSet`
/// materialization) is responsible for walking the filesystem, the glob
/// filtering, and any other non-determinism before paths reach this
/// function — this function only ever sees a set, not a walk order.
#[tracing::instrument(skip(paths))]
pub fn hash_file_set(
    paths: impl IntoIterator<Item = AbsFilePath>,
    root: &AbsDirPath,
) -> Result<String, EngineError> {
    let mut entries: Vec<(String, String)> = paths
        .into_iter()
        .map(|path| -> Result<(String, String), EngineError> {
            let file_hash = hash_file(&path)?;
            let rel = path
                .relative_to(root)
                .map_err(|_| EngineError::io(path.as_std_path(), not_under_root(root.as_std_path())))?;
            let rel_str = rel.as_str_lossy().into_owned();
            Ok((rel_str, file_hash))
        })
        .collect::<Result<_, _>>()?;

    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    let mut concatenated = String::new();
    for (rel_str, file_hash) in entries {
        let rel_hash = hex_digest(rel_str.as_bytes());
        let mut combined = Vec::with_capacity(file_hash.len() + rel_hash.len());
        combined.extend_from_slice(file_hash.as_bytes());
        combined.extend_from_slice(rel_hash.as_bytes());
        concatenated.push_str(&hex_digest(&combined));
    }

    Ok(hex_digest(concatenated.as_bytes()))
}

fn not_under_root(root: &Path) -> std::io::Error {
    std::io::Error::other(format!("path is not under root {root:?}"))
}

/// Concatenate, in declared field order, the string form of every
/// fingerprint-contributing field and SHA-256 the result.
#[tracing::instrument(skip(config))]
pub fn hash_config(config: &BuildConfig) -> String {
    let joined = config.fingerprint_fields().join("\u{1f}");
    hex_digest(joined.as_bytes())
}

/// Sort the input hashes lexicographically, concatenate, and SHA-256. The
/// sort eliminates order sensitivity; callers relying on order must embed it
/// in the hash they pass in.
pub fn combine(hashes: impl IntoIterator<Item = String>) -> String {
    let mut hashes: Vec<String> = hashes.into_iter().collect();
    hashes.sort();
    hex_digest(hashes.concat().as_bytes())
}

/// `combine({hash_config(config), combine(hash_file_set of each source set)})`.
///
/// Does not fold in dependency fingerprints: for transitive fingerprinting
/// the caller (the artifact manager) must fingerprint dependencies first and
/// fold their fingerprints in via [`combine`].
#[tracing::instrument(skip(artifact, config))]
pub fn fingerprint_artifact(
    artifact: &crate::value::CreatedArtifact,
    config: &BuildConfig,
) -> Result<String, EngineError> {
    let mut source_set_hashes = Vec::with_capacity(artifact.decl.source_sets.len());
    for source_set in &artifact.decl.source_sets {
        let files = source_set.materialize()?;
        source_set_hashes.push(hash_file_set(files, &source_set.root)?);
    }
    Ok(combine([hash_config(config), combine(source_set_hashes)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Architecture, Platform};

    fn config() -> BuildConfig {
        BuildConfig::builder()
            .profile("Debug")
            .platform(Platform::Linux)
            .architecture(Architecture::X64)
            .build()
    }

    #[test]
    fn hash_config_deterministic() {
        assert_eq!(hash_config(&config()), hash_config(&config()));
    }

    #[test]
    fn hash_config_sensitive_to_profile() {
        let mut other = config();
        other.profile = "Release".into();
        assert_ne!(hash_config(&config()), hash_config(&other));
    }

    #[test]
    fn combine_is_order_independent() {
        let a = combine(["aaa".to_string(), "bbb".to_string()]);
        let b = combine(["bbb".to_string(), "aaa".to_string()]);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_file_set_stable_under_reordering() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let file_a = dir.path().join("a.txt");
        let file_b = dir.path().join("b.txt");
        std::fs::write(&file_a, b"hello").unwrap();
        std::fs::write(&file_b, b"world").unwrap();

        let a = AbsFilePath::try_from(file_a).unwrap();
        let b = AbsFilePath::try_from(file_b).unwrap();

        let forward = hash_file_set([a.clone(), b.clone()], &root).unwrap();
        let backward = hash_file_set([b, a], &root).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn hash_file_set_sensitive_to_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let file = dir.path().join("x.txt");
        std::fs::write(&file, b"hello").unwrap();
        let path = AbsFilePath::try_from(file.clone()).unwrap();
        let before = hash_file_set([path.clone()], &root).unwrap();

        std::fs::write(&file, b"hello!").unwrap();
        let after = hash_file_set([path], &root).unwrap();

        assert_ne!(before, after);
    }

    mod props {
        //! Quantified properties 1 and 2 from `spec.md` §9: fingerprint
        //! determinism and sensitivity, over generated inputs rather than a
        //! single hard-coded example.
        use proptest::prelude::*;

        use super::*;

        fn config_with(profile: String, extra_value: String, contributing: bool) -> BuildConfig {
            BuildConfig::builder()
                .profile(profile)
                .platform(Platform::Linux)
                .architecture(Architecture::X64)
                .extra(vec![crate::value::ConfigField::builder()
                    .name("flag".to_string())
                    .value(extra_value)
                    .fingerprint_contributing(contributing)
                    .build()])
                .build()
        }

        proptest! {
            /// Property 1: identical field values hash identically across calls.
            #[test]
            fn hash_config_deterministic_over_arbitrary_fields(
                profile in "\\PC{1,20}",
                extra in "\\PC{0,20}",
                contributing in any::<bool>(),
            ) {
                let a = config_with(profile.clone(), extra.clone(), contributing);
                let b = config_with(profile, extra, contributing);
                prop_assert_eq!(hash_config(&a), hash_config(&b));
            }

            /// Property 2: changing a fingerprint-contributing field changes the
            /// hash; changing a non-contributing one never does.
            #[test]
            fn hash_config_sensitive_only_to_contributing_fields(
                profile in "\\PC{1,20}",
                extra_before in "\\PC{0,20}",
                extra_after in "\\PC{0,20}",
            ) {
                prop_assume!(extra_before != extra_after);

                let contributing_before = config_with(profile.clone(), extra_before.clone(), true);
                let contributing_after = config_with(profile.clone(), extra_after.clone(), true);
                prop_assert_ne!(hash_config(&contributing_before), hash_config(&contributing_after));

                let ignored_before = config_with(profile.clone(), extra_before, false);
                let ignored_after = config_with(profile, extra_after, false);
                prop_assert_eq!(hash_config(&ignored_before), hash_config(&ignored_after));
            }

            /// Property 2, file side: any single-byte change to a source file's
            /// content changes `hash_file_set`'s output.
            #[test]
            fn hash_file_set_sensitive_to_any_byte_change(
                original in prop::collection::vec(any::<u8>(), 1..64),
                changed_byte in any::<u8>(),
                index in 0usize..64,
            ) {
                let index = index % original.len();
                prop_assume!(original[index] != changed_byte);

                let dir = tempfile::tempdir().unwrap();
                let root = AbsDirPath::try_from(dir.path()).unwrap();
                let file = dir.path().join("x.bin");
                std::fs::write(&file, &original).unwrap();
                let path = AbsFilePath::try_from(file.clone()).unwrap();
                let before = hash_file_set([path.clone()], &root).unwrap();

                let mut mutated = original;
                mutated[index] = changed_byte;
                std::fs::write(&file, &mutated).unwrap();
                let after = hash_file_set([path], &root).unwrap();

                prop_assert_ne!(before, after);
            }
        }
    }
}
