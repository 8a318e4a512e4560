// Every registered source ships a sample payload and its golden snapshot.

#[test]
fn registered_sources_have_sample_fixtures() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    for source in petcat_adapters::REGISTERED_SOURCES {
        let dir = root.join("fixtures").join(source).join("sample");
        assert!(dir.join("records.json").exists(), "{source}: records.json missing");
        assert!(dir.join("snapshot.json").exists(), "{source}: snapshot.json missing");
    }
}

#[test]
fn sample_payloads_load_as_record_lists() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    for source in petcat_adapters::REGISTERED_SOURCES {
        let path = root.join("fixtures").join(source).join("sample").join("records.json");
        let records = petcat_adapters::load_raw_records(&path).unwrap();
        assert!(!records.is_empty(), "{source}: no records");
    }
}
