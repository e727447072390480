use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

struct EmbeddedSchema {
    name: String,
    id: String,
    sha256: String,
    body: String,
}

fn main() {
    let manifest_dir =
        PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let contracts_dir = manifest_dir.join("../../contracts/v1");
    println!("cargo:rerun-if-changed={}", contracts_dir.display());

    let mut paths: Vec<PathBuf> = fs::read_dir(&contracts_dir)
        .unwrap_or_else(|e| panic!("read {}: {e}", contracts_dir.display()))
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| file_name(path).ends_with(".schema.json"))
        .collect();
    paths.sort();

    let schemas: Vec<EmbeddedSchema> = paths.iter().map(|p| load_schema(p)).collect();

    // Set digest covers names and bodies in sorted order, NUL separated.
    let mut set = Sha256::new();
    for schema in &schemas {
        set.update(schema.name.as_bytes());
        set.update([0]);
        set.update(schema.body.as_bytes());
        set.update([0]);
    }
    let set_sha = hex(&set.finalize());
    let generated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut out = format!(
        "pub const GENERATED_CONTRACTS_SET_SHA256: &str = {set_sha:?};\n\
         pub const GENERATED_AT_RFC3339: &str = {generated_at:?};\n\
         pub const GENERATED_CONTRACT_SCHEMAS: &[(&str, &str, &str, &str)] = &[\n"
    );
    for s in &schemas {
        out.push_str(&format!(
            "    ({:?}, {:?}, {:?}, {:?}),\n",
            s.name, s.id, s.sha256, s.body
        ));
    }
    out.push_str("];\n");

    let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR"));
    fs::write(out_dir.join("generated_contracts.rs"), out).expect("write generated_contracts.rs");
}

/// Every contract must be a JSON object whose `$id` ends with its file name.
fn load_schema(path: &Path) -> EmbeddedSchema {
    println!("cargo:rerun-if-changed={}", path.display());
    let body = fs::read_to_string(path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()));
    let name = file_name(path).to_string();
    let parsed: Value = serde_json::from_str(&body)
        .unwrap_or_else(|e| panic!("{name} is not valid JSON: {e}"));
    let id = parsed
        .get("$id")
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("{name} has no string $id"))
        .to_string();
    assert!(id.ends_with(&name), "{name}: $id {id} does not end with the file name");

    EmbeddedSchema {
        sha256: hex(&Sha256::digest(body.as_bytes())),
        name,
        id,
        body,
    }
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
