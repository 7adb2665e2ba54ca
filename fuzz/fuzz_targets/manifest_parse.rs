#![no_main]

use libfuzzer_sys::fuzz_target;
use vmforge_manifest::ArtifactManifest;

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(manifest) = serde_json::from_str::<ArtifactManifest>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&manifest) {
            if let Ok(parsed) = serde_json::from_str::<ArtifactManifest>(&roundtripped) {
                assert_eq!(manifest.manifest_version, parsed.manifest_version);
                assert_eq!(manifest.disks.len(), parsed.disks.len());
            }
        }
    }
});
