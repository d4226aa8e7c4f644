#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse and validation errors are fine; panics are not.
    let Ok(cfg) = balancer_config::load_toml(data) else {
        return;
    };
    let valid = cfg.validate().is_ok();
    // The runtime conversion re-validates and must agree with validate().
    let runtime = balancer_core::BalanceCfg::try_from(&cfg);
    assert_eq!(valid, runtime.is_ok(), "validate() and conversion disagree");
});
