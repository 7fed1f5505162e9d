// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A stand-in for the test execution process, used by integration tests.
//!
//! Usage: `testrelay-fake-process <scenario> <host:port> <source file>`. Connects to the report
//! server, replays a scripted launch declaring tests from the source file, and waits for an
//! acknowledgement after every frame.

use std::{
    env,
    io::{Read, Write},
    net::TcpStream,
    process::exit,
};
use testrelay_runner::protocol::{
    CONFIRMATION_TYPE, CacheStatus, Event, ExecStatus, FailureCategory, FrameDecoder, RunInfo,
    TYPE_FIELD, TestDescriptor, encode_frame,
};

fn main() {
    let args: Vec<String> = env::args().collect();
    let [_, scenario, addr, source] = &args[..] else {
        eprintln!("[fake-process] usage: testrelay-fake-process <scenario> <host:port> <source>");
        exit(2);
    };

    let events = match scenario.as_str() {
        "pass" => pass(source),
        "logic-error" => logic_error(source),
        "close-early" => close_early(source),
        other => {
            eprintln!("[fake-process] unknown scenario {other}");
            exit(2);
        }
    };

    let mut stream = match TcpStream::connect(addr) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("[fake-process] failed to connect to {addr}: {err}");
            exit(3);
        }
    };
    let mut decoder = FrameDecoder::new(1024 * 1024);
    for event in events {
        send(&mut stream, &event);
        wait_for_ack(&mut stream, &mut decoder);
    }
}

fn declare(source: &str) -> Event {
    Event::LaunchBegin {
        tests: vec![
            TestDescriptor {
                name: "install_os".to_owned(),
                parents: Vec::new(),
                cache_status: CacheStatus::Other,
                source_file: source.into(),
            },
            TestDescriptor {
                name: "check_network".to_owned(),
                parents: vec!["install_os".to_owned()],
                cache_status: CacheStatus::Other,
                source_file: source.into(),
            },
        ],
    }
}

fn run_test(name: &str, output: &str, end: RunInfo) -> Vec<Event> {
    vec![
        Event::TestBegin {
            run: RunInfo::new(name, ExecStatus::Unknown),
        },
        Event::Report {
            run: Some(RunInfo::new(name, ExecStatus::Unknown)),
            text: output.to_owned(),
        },
        Event::ReportScreenshot {
            run: Some(RunInfo::new(name, ExecStatus::Unknown)),
            image: b"\x89PNG\r\n\x1a\n".to_vec().into(),
        },
        Event::TestEnd { run: end },
    ]
}

fn pass(source: &str) -> Vec<Event> {
    let mut events = vec![declare(source)];
    events.extend(run_test(
        "install_os",
        "installing\n",
        RunInfo::new("install_os", ExecStatus::Passed),
    ));
    events.extend(run_test(
        "check_network",
        "pinging\n",
        RunInfo::new("check_network", ExecStatus::Passed),
    ));
    events.push(Event::LaunchEnd);
    events
}

fn logic_error(source: &str) -> Vec<Event> {
    let mut events = vec![declare(source)];
    events.extend(run_test(
        "install_os",
        "installer crashed\n",
        RunInfo::new("install_os", ExecStatus::Failed)
            .with_failure_category(FailureCategory::LogicError),
    ));
    events.push(Event::TestSkipBegin {
        run: RunInfo::new("check_network", ExecStatus::Unknown),
    });
    events.push(Event::TestSkipEnd {
        run: RunInfo::new("check_network", ExecStatus::Skipped),
    });
    events.push(Event::LaunchEnd);
    events
}

fn close_early(source: &str) -> Vec<Event> {
    vec![
        declare(source),
        Event::TestBegin {
            run: RunInfo::new("install_os", ExecStatus::Unknown),
        },
    ]
}

fn send(stream: &mut TcpStream, event: &Event) {
    let frame = encode_frame(event).unwrap_or_else(|err| {
        eprintln!("[fake-process] failed to encode {}: {err}", event.kind());
        exit(4);
    });
    if let Err(err) = stream.write_all(&frame) {
        eprintln!("[fake-process] failed to send {}: {err}", event.kind());
        exit(4);
    }
}

fn wait_for_ack(stream: &mut TcpStream, decoder: &mut FrameDecoder) {
    let mut buf = [0u8; 256];
    loop {
        match decoder.next_frame() {
            Ok(Some(payload)) => {
                let value: ciborium::Value =
                    ciborium::from_reader(&payload[..]).unwrap_or_else(|err| {
                        eprintln!("[fake-process] acknowledgement is not CBOR: {err}");
                        exit(5);
                    });
                let is_ack = value.as_map().is_some_and(|entries| {
                    entries.iter().any(|(key, value)| {
                        key.as_text() == Some(TYPE_FIELD)
                            && value.as_text() == Some(CONFIRMATION_TYPE)
                    })
                });
                if !is_ack {
                    eprintln!("[fake-process] unexpected reply {value:?}");
                    exit(5);
                }
                return;
            }
            Ok(None) => {}
            Err(err) => {
                eprintln!("[fake-process] bad reply frame: {err}");
                exit(5);
            }
        }

        match stream.read(&mut buf) {
            Ok(0) => {
                eprintln!("[fake-process] report server closed the connection");
                exit(6);
            }
            Ok(n) => decoder.extend(&buf[..n]),
            Err(err) => {
                eprintln!("[fake-process] failed to read acknowledgement: {err}");
                exit(6);
            }
        }
    }
}
