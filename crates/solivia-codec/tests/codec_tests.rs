use solivia_codec::{
    checksum, decode_payload, decode_response, encode_payload, encode_request, encode_response,
    expected_frame_len, family_for, fields_for, Family, FieldMap, FrameError, ACK, ENQ, ETX, STX,
};
use types::FieldValue;

fn variant_15_values() -> FieldMap {
    let mut values = FieldMap::new();
    values.insert("part_number", FieldValue::Text("EOE46010253".to_string()));
    values.insert("serial_number", FieldValue::Text("O1S16300109WN".to_string()));
    values.insert("ac_power", FieldValue::Number(2_345.0));
    values.insert("ac_voltage", FieldValue::Number(231.0));
    values.insert("ac_current", FieldValue::Number(10.2));
    values.insert("ac_frequency", FieldValue::Number(50.01));
    values.insert("temperature_ntc_ac", FieldValue::Number(-7.0));
    values.insert("supplied_ac_energy_total", FieldValue::Number(12_345.6));
    values.insert("runtime_total", FieldValue::Number(3_600.0 * 812.0));
    values.insert("solar_isolation_resistance_input_1", FieldValue::Number(2_000_000.0));
    values.insert("alarms_status", FieldValue::Number(4.0));
    values
}

fn response_for(address: u8, family: Family, values: &FieldMap) -> Vec<u8> {
    encode_response(address, &encode_payload(family, values))
}

#[test]
fn crc_matches_arc_check_value() {
    assert_eq!(checksum(b"123456789"), 0xBB3D);
}

#[test]
fn request_frame_layout() {
    let frame = encode_request(5);
    assert_eq!(&frame[..6], &[STX, ENQ, 5, 0x02, 0x60, 0x01]);
    assert_eq!(frame[8], ETX);
    let crc = u16::from_le_bytes([frame[6], frame[7]]);
    assert_eq!(crc, checksum(&frame[1..6]));
}

#[test]
fn variant_registry_classifies_families() {
    assert_eq!(family_for(15), Some(Family::Variant15));
    assert_eq!(family_for(60), Some(Family::Variant15));
    assert_eq!(family_for(212), Some(Family::Variant212));
    assert_eq!(family_for(222), Some(Family::Variant212));
    assert_eq!(family_for(16), None);
    assert_eq!(family_for(211), None);
    assert!(fields_for(1).is_none());
    assert_eq!(Family::Variant15.payload_len(), 121);
    assert_eq!(Family::Variant212.payload_len(), 138);
}

#[test]
fn field_tables_do_not_overlap() {
    for family in [Family::Variant15, Family::Variant212] {
        let mut fields = family.fields().to_vec();
        fields.sort_by_key(|field| field.offset);
        for pair in fields.windows(2) {
            assert!(
                pair[0].end() <= pair[1].offset,
                "{} overlaps {}",
                pair[0].name,
                pair[1].name
            );
        }
    }
}

#[test]
fn response_round_trip_matches_fixture() {
    let values = variant_15_values();
    let frame = response_for(5, Family::Variant15, &values);
    assert_eq!(frame.len(), 130);
    assert_eq!(expected_frame_len(&frame[..4]), Some(130));

    let decoded = decode_response(15, &frame, 5).expect("decode");
    for (name, value) in &values {
        assert_eq!(decoded.get(name), Some(value), "field {name}");
    }
    assert_eq!(decoded.len(), Family::Variant15.fields().len());
}

#[test]
fn fixed_point_scale_is_division_exact() {
    let mut payload = vec![0u8; Family::Variant15.payload_len()];
    // ac_current raw 3 -> 0.3 A, ac_frequency raw 4_999 -> 49.99 Hz
    payload[57..59].copy_from_slice(&3u16.to_be_bytes());
    payload[63..65].copy_from_slice(&4_999u16.to_be_bytes());
    let decoded = decode_payload(Family::Variant15, &payload).expect("decode");
    assert_eq!(decoded["ac_current"], FieldValue::Number(0.3));
    assert_eq!(decoded["ac_frequency"], FieldValue::Number(49.99));
}

#[test]
fn variant_212_phases_decode() {
    let mut values = FieldMap::new();
    values.insert("ac_voltage_phase_2", FieldValue::Number(230.4));
    values.insert("ac_current_phase_3", FieldValue::Number(12.34));
    values.insert("solar_voltage_input_1", FieldValue::Number(612.5));
    values.insert("inverter_module_rack_temp", FieldValue::Number(-3.0));
    values.insert("limits_dc_2", FieldValue::Number(9.0));
    let mut payload = encode_payload(Family::Variant212, &values);
    payload.extend_from_slice(&[0xAA; 20]);
    let frame = encode_response(9, &payload);

    let decoded = decode_response(215, &frame, 9).expect("decode");
    for (name, value) in &values {
        assert_eq!(decoded.get(name), Some(value), "field {name}");
    }
}

#[test]
fn address_mismatch_is_rejected() {
    let frame = response_for(9, Family::Variant15, &variant_15_values());
    assert_eq!(
        decode_response(15, &frame, 5),
        Err(FrameError::AddressMismatch {
            expected: 5,
            actual: 9
        })
    );
}

#[test]
fn any_single_byte_corruption_is_rejected() {
    let frame = response_for(5, Family::Variant15, &variant_15_values());
    for index in 0..frame.len() {
        for mask in [0x01u8, 0x80, 0xFF] {
            let mut corrupt = frame.clone();
            corrupt[index] ^= mask;
            assert!(
                decode_response(15, &corrupt, 5).is_err(),
                "byte {index} mask {mask:#04x} accepted"
            );
        }
    }
}

#[test]
fn truncated_and_short_frames() {
    let frame = response_for(5, Family::Variant15, &variant_15_values());
    assert!(matches!(
        decode_response(15, &frame[..5], 5),
        Err(FrameError::Truncated { .. })
    ));
    assert!(matches!(
        decode_response(15, &frame[..frame.len() - 1], 5),
        Err(FrameError::Truncated { .. })
    ));

    // a valid frame whose payload belongs to the smaller family
    let short = encode_response(5, &[0u8; 40]);
    assert!(matches!(
        decode_response(15, &short, 5),
        Err(FrameError::PayloadTooShort { needed: 121, actual: 40, .. })
    ));
}

#[test]
fn nak_and_markers() {
    let mut frame = response_for(5, Family::Variant15, &variant_15_values());
    frame[1] = 0x15;
    assert_eq!(decode_response(15, &frame, 5), Err(FrameError::Nak { address: 5 }));

    let mut frame = response_for(5, Family::Variant15, &variant_15_values());
    frame[0] = ACK;
    assert!(matches!(
        decode_response(15, &frame, 5),
        Err(FrameError::BadMarker { what: "start", .. })
    ));
}

#[test]
fn unsupported_variant_is_an_error() {
    let frame = response_for(5, Family::Variant15, &variant_15_values());
    assert_eq!(
        decode_response(100, &frame, 5),
        Err(FrameError::UnsupportedVariant(100))
    );
}
