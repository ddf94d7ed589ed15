use std::net::IpAddr;

use stun::textattrs::Username;

use super::*;

#[test]
fn test_protocol_type_string() {
    assert_eq!(ProtocolType::Udp.to_string(), "udp");
    assert_eq!(ProtocolType::Tcp.to_string(), "tcp");
    assert_eq!(ProtocolType::Ssltcp.to_string(), "ssltcp");
}

#[test]
fn test_protocol_type_preference_order() {
    // UDP is the most preferred transport, TLS-over-TCP the least.
    assert!(ProtocolType::Udp < ProtocolType::Tcp);
    assert!(ProtocolType::Tcp < ProtocolType::Ssltcp);
}

#[test]
fn test_magic_cookie_add_to() -> Result<(), stun::Error> {
    let mut m = Message::new();
    MagicCookie.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut cookie = MagicCookie;
    cookie.get_from(&decoded)?;

    // The cookie is the first attribute, so its value sits at the fixed
    // offset in the encoded datagram.
    assert_eq!(
        &decoded.raw[MAGIC_COOKIE_OFFSET..MAGIC_COOKIE_OFFSET + 4],
        &TURN_MAGIC_COOKIE_VALUE
    );

    Ok(())
}

#[test]
fn test_magic_cookie_rejects_bad_value() {
    let mut m = Message::new();
    m.add(ATTR_MAGIC_COOKIE, &[0xde, 0xad, 0xbe, 0xef]);

    let mut cookie = MagicCookie;
    assert!(cookie.get_from(&m).is_err(), "bad cookie should not decode");
}

#[test]
fn test_has_magic_cookie() -> Result<(), stun::Error> {
    let mut m = Message::new();
    m.build(&[
        Box::new(TransactionId::new()),
        Box::new(send_request()),
        Box::new(MagicCookie),
        Box::new(Data(b"payload".to_vec())),
    ])?;
    assert!(has_magic_cookie(&m.raw));

    // Too short.
    assert!(!has_magic_cookie(&m.raw[..MAGIC_COOKIE_OFFSET]));

    // Mismatching bytes at the cookie offset.
    let mut tampered = m.raw.clone();
    tampered[MAGIC_COOKIE_OFFSET] ^= 0xff;
    assert!(!has_magic_cookie(&tampered));

    Ok(())
}

#[test]
fn test_destination_address_add_to() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let a = DestinationAddress {
        ip: "9.9.9.9".parse::<IpAddr>().unwrap(),
        port: 1111,
    };
    a.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut got = DestinationAddress::default();
    got.get_from(&decoded)?;
    assert_eq!(got, a, "decoded {got}, expected {a}");

    let empty = Message::new();
    let mut missing = DestinationAddress::default();
    assert_eq!(
        missing.get_from(&empty),
        Err(stun::Error::ErrAttributeNotFound)
    );

    Ok(())
}

#[test]
fn test_source_address2_add_to() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let a = SourceAddress2 {
        ip: "4.4.4.4".parse::<IpAddr>().unwrap(),
        port: 2222,
    };
    a.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut got = SourceAddress2::default();
    got.get_from(&decoded)?;
    assert_eq!(got, a);

    Ok(())
}

#[test]
fn test_options_add_to() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let opts = Options(OPTION_LOCK_DESTINATION);
    opts.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut got = Options::default();
    got.get_from(&decoded)?;
    assert_eq!(got, opts, "decoded {got}, expected {opts}");

    // Truncated value.
    let mut bad = Message::new();
    bad.add(ATTR_OPTIONS, &[1, 2, 3]);
    assert!(
        is_attr_size_invalid(&got.get_from(&bad).unwrap_err()),
        "IsAttrSizeInvalid should be true"
    );

    Ok(())
}

#[test]
fn test_send_request_round_trip() -> Result<(), stun::Error> {
    let dest = DestinationAddress {
        ip: "9.9.9.9".parse::<IpAddr>().unwrap(),
        port: 1111,
    };
    let mut m = Message::new();
    m.build(&[
        Box::new(TransactionId::new()),
        Box::new(send_request()),
        Box::new(MagicCookie),
        Box::new(Username::new(ATTR_USERNAME, "fragment".to_owned())),
        Box::new(DestinationAddress {
            ip: dest.ip,
            port: dest.port,
        }),
        Box::new(Options(OPTION_LOCK_DESTINATION)),
        Box::new(Data(b"hello".to_vec())),
    ])?;

    assert!(has_magic_cookie(&m.raw));

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;
    assert_eq!(decoded.typ, send_request());

    let username = Username::get_from_as(&decoded, ATTR_USERNAME)?;
    assert_eq!(username.text, "fragment");

    let mut got_dest = DestinationAddress::default();
    got_dest.get_from(&decoded)?;
    assert_eq!(got_dest, dest);

    let mut got_opts = Options::default();
    got_opts.get_from(&decoded)?;
    assert_eq!(got_opts.0 & OPTION_LOCK_DESTINATION, OPTION_LOCK_DESTINATION);

    let mut got_data = Data::default();
    got_data.get_from(&decoded)?;
    assert_eq!(got_data.0, b"hello".to_vec());

    Ok(())
}
