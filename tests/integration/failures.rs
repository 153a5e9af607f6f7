use courier_messenger::{MessengerError, MessengerEvent};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Malformed input and lifecycle
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_garbage_datagram_reports_error() -> Result<()> {
    let (_b, mut b_events, b_addr) = start(loopback_config()).await?;
    let raw = raw_socket().await?;

    raw.send_to(b"definitely not a chunk record", b_addr).await?;

    match next_event(&mut b_events).await? {
        MessengerEvent::Error(MessengerError::Wire(_)) => {}
        other => bail!("expected a wire error, got {other:?}"),
    }
    Ok(())
}

/// A malformed datagram does not disturb the messenger.
#[tokio::test]
async fn test_survives_garbage_then_delivers() -> Result<()> {
    let (a, _a_events, _) = start(loopback_config()).await?;
    let (_b, mut b_events, b_addr) = start(loopback_config()).await?;
    let raw = raw_socket().await?;

    raw.send_to(&[0u8; 3], b_addr).await?;
    a.send(pattern(900), b_addr)?;

    match wait_for(&mut b_events, "message", |e| matches!(e, MessengerEvent::Message(_))).await? {
        MessengerEvent::Message(message) => assert_eq!(message, pattern(900)),
        _ => unreachable!(),
    }
    Ok(())
}

#[tokio::test]
async fn test_close_releases_the_port() -> Result<()> {
    let (mut a, _a_events, a_addr) = start(loopback_config()).await?;

    a.close().await?;
    assert!(matches!(a.send(pattern(1), a_addr), Err(MessengerError::Closed)));

    // Same address binds again once the first messenger let go of it.
    let config = MessengerConfig::new(INACTIVITY, a_addr.port(), 512)?
        .with_bind_address(a_addr.ip());
    let (mut again, _events, again_addr) = start(config).await?;
    assert_eq!(again_addr, a_addr);
    again.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_api_state_errors() -> Result<()> {
    let (mut idle, _events) = Messenger::new(loopback_config());
    let somewhere: SocketAddr = "127.0.0.1:9".parse()?;

    assert!(matches!(
        idle.send(pattern(1), somewhere),
        Err(MessengerError::NotListening)
    ));

    idle.listen().await?;
    assert!(matches!(
        idle.send(Vec::new(), somewhere),
        Err(MessengerError::InvalidArgument(_))
    ));
    assert!(matches!(
        idle.listen().await,
        Err(MessengerError::AlreadyListening)
    ));

    idle.close().await?;
    idle.close().await?;
    assert!(matches!(idle.listen().await, Err(MessengerError::Closed)));
    Ok(())
}
