#![no_main]

use libfuzzer_sys::fuzz_target;
use std::time::Duration;
use vmforge_retry::{calculate_delay, RetryStrategyConfig, RetryStrategyType};

fuzz_target!(|data: (u32, u8, u64, u64, u8)| {
    let (attempt, strategy_type, base_ms, max_ms, jitter_byte) = data;

    let attempt = attempt % 100 + 1; // 1-100
    let strategy = match strategy_type % 4 {
        0 => RetryStrategyType::Immediate,
        1 => RetryStrategyType::Exponential,
        2 => RetryStrategyType::Linear,
        _ => RetryStrategyType::Constant,
    };
    let base_delay = Duration::from_millis(base_ms % 10000 + 1); // 1-10000ms
    let max_delay = Duration::from_millis(max_ms % 300000 + 100); // 100-300000ms
    let jitter = (jitter_byte as f64) / 255.0; // 0.0-1.0

    let config = RetryStrategyConfig {
        strategy,
        max_attempts: 100,
        base_delay,
        max_delay,
        jitter,
    };

    let delay = calculate_delay(&config, attempt);

    // Immediate strategy always returns zero, regardless of jitter.
    if strategy == RetryStrategyType::Immediate {
        assert_eq!(delay, Duration::ZERO);
    }

    // Without jitter the cap is exact; jitter may scale the capped value
    // back up by up to (1 + jitter), so only bound the no-jitter case.
    if jitter == 0.0 {
        assert!(delay <= max_delay);
        if strategy == RetryStrategyType::Constant {
            assert_eq!(delay, base_delay.min(max_delay));
        }
    }
});
