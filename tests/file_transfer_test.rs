mod common;

use common::{TestPeer, pattern};
use peerchat::core::TransferDirection;
use peerchat::utils::sha256_file;
use peerchat::{PeerIdentity, SessionEvent};

#[tokio::test]
async fn test_large_file_arrives_byte_identical() -> anyhow::Result<()> {
    let mut alice = TestPeer::start("alice").await?;
    let mut bob = TestPeer::start("bob").await?;
    alice.connect(&mut bob).await?;

    // 10 MiB in 64 KiB chunks: 160 chunks
    let content = pattern(10 * 1024 * 1024);
    let source = alice.shared_dir().join("big.bin");
    tokio::fs::write(&source, &content).await?;

    let transfer_id = alice
        .session
        .send_file(&PeerIdentity::from("bob"), "big.bin")
        .await?;

    let offered = bob
        .next_event(|e| matches!(e, SessionEvent::FileOffered { .. }))
        .await?;
    match &offered {
        SessionEvent::FileOffered {
            peer,
            transfer_id: offered_id,
            filename,
            total_size,
        } => {
            assert_eq!(peer.as_str(), "alice");
            assert_eq!(offered_id, &transfer_id);
            assert_eq!(filename, "big.bin");
            assert_eq!(*total_size, content.len() as u64);
        }
        other => panic!("unexpected event {:?}", other),
    }
    bob.session.accept_file(&transfer_id).await?;

    let mut last_progress = 0;
    let received = bob
        .next_event(|e| {
            if let SessionEvent::TransferProgress {
                direction: TransferDirection::Receive,
                progress,
                ..
            } = e
            {
                assert!(progress.bytes_transferred >= last_progress);
                last_progress = progress.bytes_transferred;
            }
            matches!(e, SessionEvent::FileReceived { .. })
        })
        .await?;
    let SessionEvent::FileReceived { path, peer, .. } = received else {
        unreachable!()
    };
    assert_eq!(peer.as_str(), "alice");
    assert_eq!(last_progress, content.len() as u64);
    assert_eq!(path, bob.downloads_dir().join("big.bin"));
    assert_eq!(tokio::fs::read(&path).await?, content);
    assert_eq!(sha256_file(&path).await?, sha256_file(&source).await?);

    alice
        .next_event(|e| matches!(e, SessionEvent::FileSent { transfer_id: id, .. } if *id == transfer_id))
        .await?;
    assert!(alice.session.transfers().await.is_empty());
    assert!(bob.session.transfers().await.is_empty());

    // No partial files are left behind.
    let mut entries = tokio::fs::read_dir(bob.downloads_dir()).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    assert_eq!(names, vec!["big.bin".to_string()]);

    alice.session.shutdown().await;
    bob.session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_empty_file_transfer() -> anyhow::Result<()> {
    let mut alice = TestPeer::start("alice").await?;
    let mut bob = TestPeer::start_with("bob", |c| c.transfer.auto_accept = true).await?;
    alice.connect(&mut bob).await?;

    let source = alice.shared_dir().join("empty.txt");
    tokio::fs::write(&source, b"").await?;
    alice
        .session
        .send_file(&PeerIdentity::from("bob"), &source)
        .await?;

    let received = bob
        .next_event(|e| matches!(e, SessionEvent::FileReceived { .. }))
        .await?;
    let SessionEvent::FileReceived { path, .. } = received else {
        unreachable!()
    };
    assert_eq!(tokio::fs::metadata(&path).await?.len(), 0);

    alice.session.shutdown().await;
    bob.session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_rejected_offer_is_cancelled_on_both_sides() -> anyhow::Result<()> {
    let mut alice = TestPeer::start("alice").await?;
    let mut bob = TestPeer::start("bob").await?;
    alice.connect(&mut bob).await?;

    tokio::fs::write(alice.shared_dir().join("notes.txt"), b"some notes").await?;
    let transfer_id = alice
        .session
        .send_file(&PeerIdentity::from("bob"), "notes.txt")
        .await?;
    bob.next_event(|e| matches!(e, SessionEvent::FileOffered { .. }))
        .await?;
    assert_eq!(bob.session.transfers().await.len(), 1);

    bob.session.reject_file(&transfer_id).await?;
    bob.next_event(|e| matches!(e, SessionEvent::TransferCancelled { .. }))
        .await?;
    alice
        .next_event(|e| matches!(e, SessionEvent::TransferCancelled { transfer_id: id, .. } if *id == transfer_id))
        .await?;
    assert!(alice.session.transfers().await.is_empty());
    assert!(bob.session.transfers().await.is_empty());

    // Rejecting twice is an error, not a second event.
    assert!(bob.session.reject_file(&transfer_id).await.is_err());

    alice.session.shutdown().await;
    bob.session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unaccepted_offer_times_out() -> anyhow::Result<()> {
    let mut alice = TestPeer::start_with("alice", |c| c.transfer.offer_timeout_ms = 200).await?;
    let mut bob = TestPeer::start("bob").await?;
    alice.connect(&mut bob).await?;

    tokio::fs::write(alice.shared_dir().join("late.txt"), b"nobody wants this").await?;
    let transfer_id = alice
        .session
        .send_file(&PeerIdentity::from("bob"), "late.txt")
        .await?;

    alice
        .next_event(|e| matches!(e, SessionEvent::TransferCancelled { .. }))
        .await?;
    bob.next_event(|e| matches!(e, SessionEvent::TransferCancelled { transfer_id: id, .. } if *id == transfer_id))
        .await?;
    assert!(bob.session.accept_file(&transfer_id).await.is_err());

    alice.session.shutdown().await;
    bob.session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_same_name_twice_is_deduplicated() -> anyhow::Result<()> {
    let mut alice = TestPeer::start("alice").await?;
    let mut bob = TestPeer::start_with("bob", |c| c.transfer.auto_accept = true).await?;
    alice.connect(&mut bob).await?;

    tokio::fs::write(alice.shared_dir().join("report.txt"), b"first").await?;
    alice
        .session
        .send_file(&PeerIdentity::from("bob"), "report.txt")
        .await?;
    let first = bob
        .next_event(|e| matches!(e, SessionEvent::FileReceived { .. }))
        .await?;

    tokio::fs::write(alice.shared_dir().join("report.txt"), b"second").await?;
    alice
        .session
        .send_file(&PeerIdentity::from("bob"), "report.txt")
        .await?;
    let second = bob
        .next_event(|e| matches!(e, SessionEvent::FileReceived { .. }))
        .await?;

    let (SessionEvent::FileReceived { path: first, .. }, SessionEvent::FileReceived { path: second, .. }) =
        (first, second)
    else {
        unreachable!()
    };
    assert_eq!(first, bob.downloads_dir().join("report.txt"));
    assert_eq!(second, bob.downloads_dir().join("report (1).txt"));
    assert_eq!(tokio::fs::read(&first).await?, b"first");
    assert_eq!(tokio::fs::read(&second).await?, b"second");

    alice.session.shutdown().await;
    bob.session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_receiver_cancel_stops_sender() -> anyhow::Result<()> {
    let mut alice = TestPeer::start_with("alice", |c| c.transfer.chunk_size = 1024).await?;
    let mut bob = TestPeer::start("bob").await?;
    alice.connect(&mut bob).await?;

    tokio::fs::write(alice.shared_dir().join("slow.bin"), pattern(16 * 1024 * 1024)).await?;
    let transfer_id = alice
        .session
        .send_file(&PeerIdentity::from("bob"), "slow.bin")
        .await?;
    bob.next_event(|e| matches!(e, SessionEvent::FileOffered { .. }))
        .await?;
    bob.session.accept_file(&transfer_id).await?;
    bob.next_event(|e| matches!(e, SessionEvent::TransferProgress { .. }))
        .await?;

    bob.session.cancel_transfer(&transfer_id).await?;
    bob.next_event(|e| matches!(e, SessionEvent::TransferCancelled { .. }))
        .await?;
    alice
        .next_event(|e| matches!(e, SessionEvent::TransferCancelled { transfer_id: id, .. } if *id == transfer_id))
        .await?;

    // The partial file is discarded and the connection survives.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let mut entries = tokio::fs::read_dir(bob.downloads_dir()).await?;
    assert!(entries.next_entry().await?.is_none());
    assert_eq!(alice.session.peers().await.len(), 1);

    alice.session.shutdown().await;
    bob.session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shared_files_listing_and_missing_source() -> anyhow::Result<()> {
    let mut alice = TestPeer::start("alice").await?;
    let mut bob = TestPeer::start("bob").await?;
    alice.connect(&mut bob).await?;

    tokio::fs::write(alice.shared_dir().join("b.txt"), b"bb").await?;
    tokio::fs::write(alice.shared_dir().join("a.txt"), b"a").await?;
    tokio::fs::create_dir(alice.shared_dir().join("nested")).await?;

    let files = alice.session.shared_files().await?;
    let names: Vec<_> = files.iter().map(|f| (f.name.as_str(), f.size)).collect();
    assert_eq!(names, vec![("a.txt", 1), ("b.txt", 2)]);

    let missing = alice
        .session
        .send_file(&PeerIdentity::from("bob"), "missing.txt")
        .await;
    assert!(missing.is_err());
    let directory = alice
        .session
        .send_file(&PeerIdentity::from("bob"), alice.shared_dir().join("nested"))
        .await;
    assert!(directory.is_err());
    assert!(alice.session.transfers().await.is_empty());

    alice.session.shutdown().await;
    bob.session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_peer_shared_listing_on_request() -> anyhow::Result<()> {
    let mut alice = TestPeer::start("alice").await?;
    let mut bob = TestPeer::start("bob").await?;
    alice.connect(&mut bob).await?;

    tokio::fs::write(bob.shared_dir().join("slides.pdf"), pattern(3000)).await?;
    alice
        .session
        .request_shared_files(&PeerIdentity::from("bob"))
        .await?;

    let listed = alice
        .next_event(|e| matches!(e, SessionEvent::SharedFilesListed { .. }))
        .await?;
    let SessionEvent::SharedFilesListed { peer, files } = listed else {
        unreachable!()
    };
    assert_eq!(peer.as_str(), "bob");
    let names: Vec<_> = files.iter().map(|f| (f.name.as_str(), f.size)).collect();
    assert_eq!(names, vec![("slides.pdf", 3000)]);

    // The listed name can be fetched by asking bob to send it.
    bob.session
        .send_file(&PeerIdentity::from("alice"), &files[0].name)
        .await?;
    alice
        .next_event(|e| matches!(e, SessionEvent::FileOffered { filename, .. } if filename == "slides.pdf"))
        .await?;

    assert!(matches!(
        alice.session.request_shared_files(&PeerIdentity::from("nobody")).await,
        Err(peerchat::ChatError::PeerNotFound(_))
    ));

    alice.session.shutdown().await;
    bob.session.shutdown().await;
    Ok(())
}
