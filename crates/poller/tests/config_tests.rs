use std::time::Duration;

use poller::config::{DEFAULT_THROTTLE, GATEWAY_POLL_INTERVAL};
use poller::{configure, BusParams, ConfigError, FieldSpec, InverterSpec, Stamp};
use solivia_codec::{Family, FieldMap};
use tokio::time::Instant;
use types::FieldValue;

#[test]
fn rejects_empty_bus() {
    assert_eq!(
        configure(BusParams::default(), Vec::new()).unwrap_err(),
        ConfigError::NoInverters
    );
}

#[test]
fn rejects_duplicate_and_zero_addresses() {
    let err = configure(
        BusParams::default(),
        vec![InverterSpec::new(5, 15), InverterSpec::new(5, 212)],
    )
    .unwrap_err();
    assert_eq!(err, ConfigError::DuplicateAddress(5));

    let err = configure(BusParams::default(), vec![InverterSpec::new(0, 15)]).unwrap_err();
    assert_eq!(err, ConfigError::InvalidAddress(0));
}

#[test]
fn rejects_unknown_variants() {
    for variant in [0, 16, 100, 211, 223, 255] {
        let err = configure(BusParams::default(), vec![InverterSpec::new(3, variant)]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnsupportedVariant {
                address: 3,
                variant
            }
        );
    }
}

#[test]
fn rejects_fields_outside_family_table() {
    // phase fields only exist in the three-phase layout
    let err = configure(
        BusParams::default(),
        vec![InverterSpec::new(2, 15).with_fields(["ac_power", "ac_voltage_phase_1"])],
    )
    .unwrap_err();
    assert_eq!(
        err,
        ConfigError::UnknownField {
            address: 2,
            field: "ac_voltage_phase_1".to_string(),
            family: "variant_15",
        }
    );
}

#[test]
fn rejects_invalid_timing() {
    let spec = || vec![InverterSpec::new(1, 15)];

    let bus = BusParams {
        response_timeout: Duration::ZERO,
        ..BusParams::default()
    };
    assert!(matches!(
        configure(bus, spec()),
        Err(ConfigError::InvalidTimeout { actual: 0 })
    ));

    let bus = BusParams {
        response_timeout: Duration::from_secs(2),
        ..BusParams::default()
    };
    assert!(matches!(
        configure(bus, spec()),
        Err(ConfigError::InvalidTimeout { actual: 2_000 })
    ));

    let bus = BusParams {
        poll_interval: Duration::ZERO,
        ..BusParams::default()
    };
    assert_eq!(configure(bus, spec()).unwrap_err(), ConfigError::InvalidInterval);
}

#[test]
fn gateway_mode_fixes_interval() {
    let bus = BusParams {
        has_gateway: true,
        poll_interval: Duration::from_secs(7),
        ..BusParams::default()
    };
    let plan = configure(bus, vec![InverterSpec::new(1, 15)]).unwrap();
    assert_eq!(plan.poll_interval, GATEWAY_POLL_INTERVAL);

    let bus = BusParams {
        poll_interval: Duration::from_millis(250),
        ..BusParams::default()
    };
    let plan = configure(bus, vec![InverterSpec::new(1, 15)]).unwrap();
    assert_eq!(plan.poll_interval, Duration::from_millis(250));
}

#[test]
fn enabled_fields_are_resolved_once() {
    let mut spec = InverterSpec::new(7, 218);
    spec.fields = vec![
        FieldSpec::named("ac_power"),
        FieldSpec {
            name: "supplied_ac_energy_total".to_string(),
            throttle: Some(Duration::from_secs(60)),
        },
    ];
    let plan = configure(
        BusParams::default(),
        vec![spec, InverterSpec::new(8, 15)],
    )
    .unwrap();

    let three_phase = &plan.inverters[0];
    assert_eq!(three_phase.family(), Family::Variant212);
    assert_eq!(
        three_phase.enabled_fields().collect::<Vec<_>>(),
        vec!["ac_power", "supplied_ac_energy_total"]
    );

    // no explicit list enables the whole table
    let single_phase = &plan.inverters[1];
    assert_eq!(
        single_phase.enabled_fields().count(),
        Family::Variant15.fields().len()
    );
    assert_eq!(DEFAULT_THROTTLE, Duration::from_secs(10));
}

#[test]
fn apply_twice_yields_identical_output() {
    let plan = configure(
        BusParams::default(),
        vec![InverterSpec::new(4, 15)
            .with_fields(["ac_power", "serial_number", "supplied_ac_energy_total"])
            .with_throttle(Duration::ZERO)],
    )
    .unwrap();
    let mut inverter = plan.inverters.into_iter().next().unwrap();

    let mut decoded = FieldMap::new();
    decoded.insert("ac_power", FieldValue::Number(1_234.0));
    decoded.insert("serial_number", FieldValue::Text("O1S16300109WN".to_string()));
    decoded.insert("supplied_ac_energy_total", FieldValue::Number(5_432.1));
    decoded.insert("ac_current", FieldValue::Number(5.0));

    let stamp = Stamp {
        at: Instant::now(),
        unix_ms: 1_700_000_000_000,
    };
    let first = inverter.apply(&decoded, stamp);
    let snapshot = inverter.snapshot();
    let second = inverter.apply(&decoded, stamp);

    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
    assert_eq!(inverter.snapshot(), snapshot);
    assert!(inverter.value("ac_current").is_none());
}

#[test]
fn apply_keeps_fields_missing_from_frame() {
    let plan = configure(
        BusParams::default(),
        vec![InverterSpec::new(4, 15).with_fields(["ac_power", "ac_voltage"])],
    )
    .unwrap();
    let mut inverter = plan.inverters.into_iter().next().unwrap();
    let now = Instant::now();

    let mut decoded = FieldMap::new();
    decoded.insert("ac_power", FieldValue::Number(900.0));
    decoded.insert("ac_voltage", FieldValue::Number(229.0));
    inverter.apply(&decoded, Stamp { at: now, unix_ms: 1 });

    assert_eq!(inverter.record_failure(), 1);
    assert_eq!(inverter.record_failure(), 2);

    let mut partial = FieldMap::new();
    partial.insert("ac_power", FieldValue::Number(950.0));
    inverter.apply(&partial, Stamp { at: now, unix_ms: 2 });

    assert_eq!(inverter.consecutive_failures(), 0);
    let voltage = inverter.value("ac_voltage").unwrap();
    assert_eq!(voltage.value, FieldValue::Number(229.0));
    assert_eq!(voltage.updated_at_ms, 1);
    assert_eq!(inverter.value("ac_power").unwrap().updated_at_ms, 2);
    assert_eq!(inverter.snapshot().total_failures, 2);
}

#[test]
fn cache_carries_unit_and_precision() {
    let plan = configure(
        BusParams::default(),
        vec![InverterSpec::new(6, 15).with_fields(["ac_current", "ac_frequency", "ac_power"])],
    )
    .unwrap();
    let mut inverter = plan.inverters.into_iter().next().unwrap();

    let mut decoded = FieldMap::new();
    decoded.insert("ac_current", FieldValue::Number(4.2));
    decoded.insert("ac_frequency", FieldValue::Number(50.01));
    decoded.insert("ac_power", FieldValue::Number(980.0));
    inverter.apply(&decoded, Stamp { at: Instant::now(), unix_ms: 3 });

    let current = inverter.value("ac_current").unwrap();
    assert_eq!((current.unit, current.precision), ("A", 1));
    let frequency = inverter.value("ac_frequency").unwrap();
    assert_eq!((frequency.unit, frequency.precision), ("Hz", 2));
    let power = inverter.value("ac_power").unwrap();
    assert_eq!((power.unit, power.precision), ("W", 0));
}

#[test]
fn listen_only_is_carried_into_plan() {
    let bus = BusParams {
        listen_only: true,
        poll_interval: Duration::from_millis(300),
        ..BusParams::default()
    };
    let plan = configure(bus, vec![InverterSpec::new(1, 15)]).unwrap();
    assert!(plan.listen_only);
    assert_eq!(plan.poll_interval, Duration::from_millis(300));
    assert!(!configure(BusParams::default(), vec![InverterSpec::new(1, 15)]).unwrap().listen_only);
}
