//! Identifier sanitization for knowledge base names
//!
//! Knowledge bases carry arbitrary human-chosen names (any Unicode). The vector
//! engine and the model provider each accept a much narrower identifier
//! alphabet, so every name is mapped into two namespaces:
//!
//! - storage collection ids: `[A-Za-z0-9._-]`, 3..=512 chars, alphanumeric at both ends
//! - tool ids: `[A-Za-z0-9_]`, 3..=64 chars
//!
//! Both mappings are pure and total. Names that sanitize to fewer than three
//! characters fall back to their alphanumeric residue, then to a prefix plus a
//! stable hash of the original name.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Minimum identifier length accepted by both namespaces
pub const MIN_ID_LEN: usize = 3;

/// Maximum length of a storage collection id
pub const MAX_STORAGE_ID_LEN: usize = 512;

/// Maximum length of a tool id (and of a full tool name)
pub const MAX_TOOL_ID_LEN: usize = 64;

/// Suffix appended to the tool id of every retrieval tool
pub const TOOL_NAME_SUFFIX: &str = "_knowledge_base_tool";

const HASH_MODULUS: u64 = 100_000;

struct IdentifierRule {
    disallowed: Regex,
    replacement: &'static str,
    fallback_prefix: &'static str,
    max_len: usize,
}

static STORAGE_RULE: LazyLock<IdentifierRule> = LazyLock::new(|| IdentifierRule {
    disallowed: Regex::new(r"[^A-Za-z0-9._-]+").expect("storage id pattern is valid"),
    replacement: "-",
    fallback_prefix: "kb-",
    max_len: MAX_STORAGE_ID_LEN,
});

static TOOL_RULE: LazyLock<IdentifierRule> = LazyLock::new(|| IdentifierRule {
    disallowed: Regex::new(r"[^A-Za-z0-9_]+").expect("tool id pattern is valid"),
    replacement: "_",
    fallback_prefix: "kb_",
    max_len: MAX_TOOL_ID_LEN,
});

/// Map a knowledge base name to a storage collection id
pub fn to_storage_id(name: &str) -> String {
    sanitize(name, &STORAGE_RULE)
}

/// Map a knowledge base name to a tool id
pub fn to_tool_id(name: &str) -> String {
    sanitize(name, &TOOL_RULE)
}

/// Full name of the retrieval tool bound to a knowledge base.
///
/// The tool id part is shortened when needed so the whole name never exceeds
/// [`MAX_TOOL_ID_LEN`].
pub fn tool_name(kb_name: &str) -> String {
    let budget = MAX_TOOL_ID_LEN - TOOL_NAME_SUFFIX.len();
    let id = clamp(&to_tool_id(kb_name), budget);
    format!("{}{}", id, TOOL_NAME_SUFFIX)
}

/// Tool name for a knowledge base whose plain [`tool_name`] is already taken.
///
/// Inserts the name's stable hash before the suffix, e.g.
/// `Acme_Corp_12345_knowledge_base_tool`, still within [`MAX_TOOL_ID_LEN`].
pub fn disambiguated_tool_name(kb_name: &str) -> String {
    let tag = format!("_{:05}", stable_hash(kb_name) % HASH_MODULUS);
    let budget = MAX_TOOL_ID_LEN - TOOL_NAME_SUFFIX.len() - tag.len();
    let id = clamp(&to_tool_id(kb_name), budget);
    format!("{}{}{}", id, tag, TOOL_NAME_SUFFIX)
}

/// Hash used by the fallback path.
///
/// First eight bytes of SHA-256 over the UTF-8 name, read big endian. Unlike
/// `std`'s `DefaultHasher` this is identical across processes and releases,
/// so collection ids stay put when the binary restarts.
pub fn stable_hash(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

fn sanitize(name: &str, rule: &IdentifierRule) -> String {
    let replaced = rule.disallowed.replace_all(name, rule.replacement);
    let trimmed = replaced.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    let primary = clamp(trimmed, rule.max_len);
    if primary.len() >= MIN_ID_LEN {
        return primary;
    }

    let residue: String = name.chars().filter(char::is_ascii_alphanumeric).collect();
    let residue = clamp(&residue, rule.max_len);
    if residue.len() >= MIN_ID_LEN {
        return residue;
    }

    format!("{}{}", rule.fallback_prefix, stable_hash(name) % HASH_MODULUS)
}

// Input is ASCII by construction, so byte truncation never splits a char.
fn clamp(id: &str, max_len: usize) -> String {
    let cut = &id[..id.len().min(max_len)];
    cut.trim_end_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_names() -> Vec<String> {
        let mut names: Vec<String> = [
            "",
            " ",
            "a",
            "ab",
            "abc",
            "客服",
            "知识库",
            "Acme Corp 客服",
            "personal_information",
            "--leading and trailing--",
            "...dots...",
            "___",
            "a.b",
            "x_y",
            "🚀🚀🚀",
            "name/with\\slashes",
            "tab\tnew\nline",
            "Ünïcödé Näme",
            "a________________________________________________________________________b",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        names.push("long".repeat(300));
        names.push(format!("a{}b", ".".repeat(700)));
        names.push("数据".repeat(400));
        names
    }

    fn is_storage_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'
    }

    fn is_tool_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_'
    }

    #[test]
    fn test_storage_id_properties() {
        for name in sample_names() {
            let id = to_storage_id(&name);
            assert!(
                (MIN_ID_LEN..=MAX_STORAGE_ID_LEN).contains(&id.len()),
                "bad length for {:?}: {:?}",
                name,
                id
            );
            assert!(id.chars().all(is_storage_char), "bad charset for {:?}: {:?}", name, id);
            assert!(id.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()));
            assert!(id.chars().last().is_some_and(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_tool_id_properties() {
        for name in sample_names() {
            let id = to_tool_id(&name);
            assert!(
                (MIN_ID_LEN..=MAX_TOOL_ID_LEN).contains(&id.len()),
                "bad length for {:?}: {:?}",
                name,
                id
            );
            assert!(id.chars().all(is_tool_char), "bad charset for {:?}: {:?}", name, id);

            let full = tool_name(&name);
            assert!(full.len() <= MAX_TOOL_ID_LEN);
            assert!(full.ends_with(TOOL_NAME_SUFFIX));
            assert!(full.chars().all(is_tool_char));
        }
    }

    #[test]
    fn test_deterministic() {
        for name in sample_names() {
            assert_eq!(to_storage_id(&name), to_storage_id(&name));
            assert_eq!(to_tool_id(&name), to_tool_id(&name));
            assert_eq!(tool_name(&name), tool_name(&name));
        }
    }

    #[test]
    fn test_disambiguated_tool_name() {
        for name in sample_names() {
            let full = disambiguated_tool_name(&name);
            assert!(full.len() <= MAX_TOOL_ID_LEN, "too long for {:?}: {:?}", name, full);
            assert!(full.ends_with(TOOL_NAME_SUFFIX));
            assert!(full.chars().all(is_tool_char));
            assert_ne!(full, tool_name(&name));
            assert_eq!(full, disambiguated_tool_name(&name));
        }

        let plain = disambiguated_tool_name("Acme Corp");
        let mixed = disambiguated_tool_name("Acme Corp 客服");
        assert!(plain.starts_with("Acme_Corp_"));
        assert!(mixed.starts_with("Acme_Corp_"));
        assert_ne!(plain, mixed);
    }

    #[test]
    fn test_mixed_script_example() {
        assert_eq!(to_storage_id("Acme Corp 客服"), "Acme-Corp");
        assert_eq!(to_tool_id("Acme Corp 客服"), "Acme_Corp");
        assert_eq!(tool_name("Acme Corp 客服"), "Acme_Corp_knowledge_base_tool");
    }

    #[test]
    fn test_runs_collapse_to_one_separator() {
        assert_eq!(to_storage_id("a  !!  b"), "a-b");
        assert_eq!(to_tool_id("a  !!  b"), "a_b");
        assert_eq!(to_storage_id("v1.2_beta"), "v1.2_beta");
        assert_eq!(to_tool_id("v1.2-beta"), "v1_2_beta");
    }

    #[test]
    fn test_residue_fallback() {
        assert_eq!(to_storage_id("a b"), "a-b");
        assert_eq!(to_storage_id("x客服yz"), "x-yz");
        assert_eq!(to_storage_id("a.......................b"), "a.......................b");

        // The length cut lands inside the separator run, leaving only "a"
        let dotted = format!("a{}bcd", ".".repeat(600));
        assert_eq!(to_storage_id(&dotted), "abcd");
        let underscored = format!("a{}bcd", "_".repeat(100));
        assert_eq!(to_tool_id(&underscored), "abcd");

        // One alphanumeric char is not enough for either fallback but the hash
        assert_eq!(to_storage_id("…x…"), format!("kb-{}", stable_hash("…x…") % 100_000));
    }

    #[test]
    fn test_hash_fallback() {
        let id = to_storage_id("客服");
        assert_eq!(id, format!("kb-{}", stable_hash("客服") % 100_000));
        let id = to_tool_id("客服");
        assert_eq!(id, format!("kb_{}", stable_hash("客服") % 100_000));
        assert_ne!(to_storage_id("客服"), to_storage_id("知识"));
    }

    #[test]
    fn test_truncation_keeps_alphanumeric_tail() {
        let name = format!("a{}b", ".".repeat(700));
        let id = to_storage_id(&name);
        // The residue "ab" is too short as well
        assert!(id.starts_with("kb-"));

        let long = "abc-".repeat(200);
        let id = to_storage_id(&long);
        assert!(id.len() <= MAX_STORAGE_ID_LEN);
        assert!(id.ends_with('c'));
    }

    #[test]
    fn test_stable_hash_is_fixed() {
        // SHA-256("") starts with e3b0c442 98fc1c14
        assert_eq!(stable_hash(""), 0xe3b0_c442_98fc_1c14);
    }
}
