use std::path::PathBuf;

use petcat_core::PetType;
use petcat_sync::{PetTypeClassifier, SyncConfig, TextNormalizer};

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[test]
fn shipped_rule_files_parse() {
    let classifier = PetTypeClassifier::from_workspace_root(&workspace_root()).unwrap();
    assert_eq!(classifier.rules().len(), 3);
    assert_eq!(classifier.classify("Fieno per conigli", None), PetType::SmallAnimal);

    let text = TextNormalizer::from_workspace_root(&workspace_root()).unwrap();
    let tokens = text.tokens("Almo Nature HFC con Tonno 6x70g");
    assert!(tokens.contains("almo"));
    assert!(tokens.contains("tonno"));
    assert!(!tokens.contains("con"));
    assert!(!tokens.contains("6x70g"));
}

#[test]
fn shipped_source_registry_uses_registered_normalizers() {
    let config = SyncConfig {
        workspace_root: workspace_root(),
        ..SyncConfig::default()
    };
    let registry = config.load_source_registry().unwrap();
    assert!(!registry.sources.is_empty());
    for source in &registry.sources {
        assert!(
            petcat_adapters::normalizer_for_source(&source.source).is_some(),
            "{} has no normalizer",
            source.source
        );
        assert!(!source.targets.is_empty(), "{} has no targets", source.source);
    }
}
