use std::path::Path;

use acq_daemon::config::{DaemonConfig, SourceConfig};
use neuro_types::{BackendChoice, ControllerVariant};

#[test]
fn default_config_builds_a_session() {
    let config_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("configs/default.yaml");

    let config = DaemonConfig::load(&config_path).expect("Failed to load default config");
    assert_eq!(config.acquisition.variant, ControllerVariant::Usb3Record);
    assert_eq!(config.executor.backend, BackendChoice::Auto);
    assert!(matches!(config.source, SourceConfig::Synthetic(ref s) if s.paced));
    assert!(config.recording.trigger.is_none());

    let session = config.session().expect("Default config should validate");
    assert_eq!(session.channels.len(), 64);
    for name in &config.recording.channels {
        assert!(session.channel_by_name(name).is_some(), "missing channel {}", name);
    }
}
