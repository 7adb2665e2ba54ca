#![no_main]

use libfuzzer_sys::fuzz_target;
use vmforge_types::{WebhookEvent, WebhookType};
use vmforge_webhook::render_payload;

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };

    let Ok(event) = serde_json::from_str::<WebhookEvent>(json_str) else {
        return;
    };

    for webhook_type in [
        WebhookType::Slack,
        WebhookType::Discord,
        WebhookType::Generic,
        WebhookType::Email,
    ] {
        let payload = render_payload(webhook_type, &event);
        assert!(payload.is_object());
    }
});
