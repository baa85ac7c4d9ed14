//! Edge cases and hostile input.

use pbr_keeper::classify::{parse_entries, EntryKind};
use pbr_keeper::config::Config;
use pbr_keeper::error::PbrError;

#[test]
fn test_unicode_and_binary_garbage_is_skipped() {
    let content = "exämple.com\n\u{0}\u{1}\n日本.jp\n\u{feff}10.0.0.1\nok.example\n";
    let parsed = parse_entries(content, "#");
    assert_eq!(parsed.count(EntryKind::Domain), 1);
    assert!(parsed.invalid_lines >= 3);
}

#[test]
fn test_empty_and_whitespace_only() {
    for content in ["", "\n\n\n", "   \n\t\n", "# only comments\n# more\n"] {
        let parsed = parse_entries(content, "#");
        assert!(parsed.entries.is_empty());
        assert_eq!(parsed.invalid_lines, 0);
    }
}

#[test]
fn test_large_list_deduplicates() {
    let mut content = String::new();
    for i in 0..50_000u32 {
        content.push_str(&format!("10.{}.{}.0/24\n", (i >> 8) & 0xff, i & 0xff));
        content.push_str("dup.example.com\n");
    }
    let parsed = parse_entries(&content, "#");
    assert_eq!(parsed.count(EntryKind::Ipv4), 50_000);
    assert_eq!(parsed.count(EntryKind::Domain), 1);
}

#[test]
fn test_host_bits_are_canonicalized() {
    let parsed = parse_entries("10.1.2.3/8\n10.0.0.0/8\n", "#");
    assert_eq!(parsed.entries.len(), 1);
    assert_eq!(parsed.entries[0].to_string(), "10.0.0.0/8");
}

#[test]
fn test_malformed_yaml_is_rejected() {
    let cases = [
        "lists: [",
        "ipsets:\n  - name: p1\n    routing: 5\n",
        "lists:\n  - name: a\n    type: ftp\n    url: ftp://x\n",
    ];
    for yaml in cases {
        assert!(serde_yaml::from_str::<Config>(yaml).is_err(), "{}", yaml);
    }
}

#[test]
fn test_hostile_policy_names_rejected() {
    let yaml = r#"
lists:
  - name: l1
    type: inline
    entries: [10.0.0.0/8]
ipsets:
  - name: "p1; rm -rf /"
    lists: [l1]
    routing: { interfaces: [eth0], fwmark: 1, table: 1, priority: 1 }
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert!(matches!(config.validate(), Err(PbrError::Validation(_))));
}

#[test]
fn test_reserved_table_rejected() {
    let yaml = r#"
lists:
  - name: l1
    type: inline
    entries: [10.0.0.0/8]
ipsets:
  - name: p1
    lists: [l1]
    routing: { interfaces: [eth0], fwmark: 1, table: 254, priority: 1 }
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert!(matches!(config.validate(), Err(PbrError::Validation(_))));
}

#[test]
fn test_error_envelope_shape() {
    let err = PbrError::Conflict("List 'l1' is referenced by p1".to_string());
    let json = serde_json::to_value(err.to_envelope()).unwrap();
    assert_eq!(json["error"]["code"], "conflict");
    assert!(json["error"]["message"].as_str().unwrap().contains("l1"));
}
