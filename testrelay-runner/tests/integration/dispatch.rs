// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::SourceDir;
use color_eyre::eyre::{Result, bail};
use pretty_assertions::assert_eq;
use std::error::Error;
use testrelay_runner::{
    dispatcher::{DispatchState, EventDispatcher},
    errors::{DispatchError, TransportError},
    grouping::StatusLabel,
    protocol::{
        CacheStatus, Event, ExecStatus, FrameDecoder, RunInfo, TestDescriptor, confirmation,
        encode_frame,
    },
    server::ReportServer,
    tracker::{
        ExecId, ResultReport, ResultUpdate,
        test_helpers::{RecordingTracker, TrackerCall},
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

struct Client {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl Client {
    async fn connect(server: &ReportServer) -> Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(server.local_addr()).await?,
            decoder: FrameDecoder::new(1024),
        })
    }

    async fn send(&mut self, event: &Event) -> Result<()> {
        self.stream.write_all(&encode_frame(event)?).await?;
        let mut buf = [0u8; 64];
        loop {
            if let Some(payload) = self.decoder.next_frame()? {
                let value: ciborium::Value = ciborium::from_reader(&payload[..])?;
                assert_eq!(value, confirmation());
                return Ok(());
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                bail!("server closed the connection before acknowledging {}", event.kind());
            }
            self.decoder.extend(&buf[..n]);
        }
    }
}

fn declare(source: &SourceDir) -> Event {
    Event::LaunchBegin {
        tests: vec![
            TestDescriptor {
                name: "boot".to_owned(),
                parents: Vec::new(),
                cache_status: CacheStatus::Ok,
                source_file: source.files[0].clone(),
            },
            TestDescriptor {
                name: "login".to_owned(),
                parents: vec!["boot".to_owned()],
                cache_status: CacheStatus::Other,
                source_file: source.files[1].clone(),
            },
        ],
    }
}

#[tokio::test]
async fn dispatch_over_loopback() -> Result<()> {
    let source = SourceDir::new(&["a.testo", "b.testo"])?;
    let server = ReportServer::bind("127.0.0.1", 1024 * 1024).await?;
    let tracker = RecordingTracker::new();
    let mut dispatcher = EventDispatcher::new(source.grouping(), tracker.clone());

    let events = vec![
        declare(&source),
        Event::TestBegin {
            run: RunInfo::new("login", ExecStatus::Unknown),
        },
        Event::Report {
            run: Some(RunInfo::new("login", ExecStatus::Unknown)),
            text: "login prompt found\n".to_owned(),
        },
        Event::TestEnd {
            run: RunInfo::new("login", ExecStatus::Failed),
        },
        Event::LaunchEnd,
    ];
    let client = async {
        let mut client = Client::connect(&server).await?;
        for event in &events {
            client.send(event).await?;
        }
        Ok::<_, color_eyre::Report>(())
    };
    let serve = async {
        let mut transport = server.accept().await?;
        dispatcher.serve(&mut transport).await?;
        Ok::<_, color_eyre::Report>(())
    };
    tokio::try_join!(client, serve)?;

    assert_eq!(dispatcher.state(), DispatchState::Done);
    // The cached group never ran anything, so it was never synced.
    let login_file = source.files[1].clone();
    assert_eq!(
        tracker.calls()[..2],
        [
            TrackerCall::Create(ResultReport {
                source_file: login_file,
                status: StatusLabel::InProgress,
                comment: None,
            }),
            TrackerCall::Update(
                ExecId::new("result-1"),
                ResultUpdate {
                    status: StatusLabel::Fail,
                    comment: Some("login prompt found\n".to_owned()),
                }
            ),
        ]
    );

    let summary = dispatcher.summary()?;
    let statuses: Vec<_> = summary.groups.iter().map(|group| group.status).collect();
    assert_eq!(statuses, [StatusLabel::Pass, StatusLabel::Fail]);
    Ok(())
}

#[tokio::test]
async fn early_close_keeps_synced_results() -> Result<()> {
    let source = SourceDir::new(&["a.testo", "b.testo"])?;
    let server = ReportServer::bind("127.0.0.1", 1024 * 1024).await?;
    let tracker = RecordingTracker::new();
    let mut dispatcher = EventDispatcher::new(source.grouping(), tracker.clone());

    let events = vec![
        declare(&source),
        Event::TestBegin {
            run: RunInfo::new("login", ExecStatus::Unknown),
        },
    ];
    let client = async {
        let mut client = Client::connect(&server).await?;
        for event in &events {
            client.send(event).await?;
        }
        // Dropping the client closes the connection before launch_end.
        Ok::<_, color_eyre::Report>(())
    };
    let serve = async {
        let mut transport = server.accept().await?;
        Ok::<_, color_eyre::Report>(dispatcher.serve(&mut transport).await)
    };
    let ((), res) = tokio::try_join!(client, serve)?;

    match res {
        Err(DispatchError::Transport(TransportError::ConnectionClosed { .. })) => {}
        other => bail!("expected ConnectionClosed, found {other:?}"),
    }
    assert_eq!(dispatcher.state(), DispatchState::Running);
    assert_eq!(
        tracker.calls(),
        [TrackerCall::Create(ResultReport {
            source_file: source.files[1].clone(),
            status: StatusLabel::InProgress,
            comment: None,
        })]
    );
    Ok(())
}

#[tokio::test]
async fn oversized_frame_is_rejected() -> Result<()> {
    let server = ReportServer::bind("127.0.0.1", 16).await?;
    let tracker = RecordingTracker::new();
    let mut dispatcher = EventDispatcher::new(Default::default(), tracker.clone());

    let client = async {
        let mut stream = TcpStream::connect(server.local_addr()).await?;
        stream.write_all(&1000u32.to_le_bytes()).await?;
        Ok::<_, color_eyre::Report>(stream)
    };
    let serve = async {
        let mut transport = server.accept().await?;
        Ok::<_, color_eyre::Report>(dispatcher.serve(&mut transport).await)
    };
    let (_stream, res) = tokio::try_join!(client, serve)?;

    let err = match res {
        Err(err) => err,
        Ok(()) => bail!("oversized frame was accepted"),
    };
    assert_eq!(
        err.source().map(ToString::to_string),
        Some("frame declares 1000 bytes, which exceeds the maximum of 16 bytes".to_owned())
    );
    assert!(tracker.calls().is_empty());
    Ok(())
}
