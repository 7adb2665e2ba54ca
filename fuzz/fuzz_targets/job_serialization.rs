#![no_main]

use libfuzzer_sys::fuzz_target;
use vmforge_types::{Job, ProgressInfo, ScheduledJob};

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(job) = serde_json::from_str::<Job>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&job) {
            if let Ok(parsed) = serde_json::from_str::<Job>(&roundtripped) {
                assert_eq!(job.id, parsed.id);
                assert_eq!(job.status, parsed.status);
            }
        }
    }

    if let Ok(progress) = serde_json::from_str::<ProgressInfo>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&progress) {
            if let Ok(parsed) = serde_json::from_str::<ProgressInfo>(&roundtripped) {
                assert_eq!(progress.task_id, parsed.task_id);
            }
        }
    }

    if let Ok(scheduled) = serde_json::from_str::<ScheduledJob>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&scheduled) {
            if let Ok(parsed) = serde_json::from_str::<ScheduledJob>(&roundtripped) {
                assert_eq!(scheduled.id, parsed.id);
                assert_eq!(scheduled.cron_expression, parsed.cron_expression);
            }
        }
    }
});
