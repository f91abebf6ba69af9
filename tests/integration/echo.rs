#[path = "common/mod.rs"]
mod common;

use std::{
    io::{BufRead, BufReader, Read, Write},
    net::TcpStream,
    thread,
    time::Duration,
};

use common::assert_tree_state;
use subsys::{SubsystemState, Timeout, config::Config, echo::EchoService};

fn config(workers: usize, connection_timeout: &str) -> Config {
    Config::from_yaml(&format!(
        r#"
version: "1"
server:
  name: it
  listen: "127.0.0.1:0"
  accept_poll: "20ms"
  connection_timeout: "{connection_timeout}"
dispatcher:
  workers: {workers}
  poll_interval: "20ms"
"#
    ))
    .unwrap()
}

fn start(service: &EchoService) -> thread::JoinHandle<Result<(), subsys::RuntimeError>> {
    let runner = {
        let service = service.clone();
        thread::spawn(move || service.run())
    };
    assert!(
        service
            .server()
            .subsystem()
            .wait_for(SubsystemState::Running, Timeout::from_secs(5))
    );
    runner
}

fn connect(service: &EchoService) -> TcpStream {
    let stream = TcpStream::connect(service.local_addr().unwrap()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

#[test]
fn echoes_lines_from_concurrent_clients() {
    let service = EchoService::build(&config(3, "5s")).unwrap();
    let runner = start(&service);

    let clients: Vec<_> = (0..3)
        .map(|client| {
            let mut stream = connect(&service);
            thread::spawn(move || {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                for n in 0..5 {
                    let line = format!("client {client} line {n}\n");
                    stream.write_all(line.as_bytes()).unwrap();
                    let mut reply = String::new();
                    reader.read_line(&mut reply).unwrap();
                    assert_eq!(reply, line);
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    service.shutdown_handle().shutdown().unwrap();
    runner.join().unwrap().unwrap();
    assert_tree_state(service.server().subsystem(), SubsystemState::Idling);
    assert!(service.dispatcher().counters().executed >= 3);
}

#[test]
fn idle_connection_is_closed_after_timeout() {
    let service = EchoService::build(&config(1, "100ms")).unwrap();
    let runner = start(&service);

    let mut stream = connect(&service);
    let mut buf = Vec::new();
    // The server hangs up on its own; EOF arrives well before the client timeout.
    assert_eq!(stream.read_to_end(&mut buf).unwrap(), 0);

    service.shutdown_handle().shutdown().unwrap();
    runner.join().unwrap().unwrap();
}

#[test]
fn listener_stopping_on_its_own_stops_the_server() {
    let service = EchoService::build(&config(2, "5s")).unwrap();
    let runner = start(&service);

    service.listener().request_stop().unwrap();

    runner.join().unwrap().unwrap();
    assert_tree_state(service.server().subsystem(), SubsystemState::Idling);
    assert_eq!(service.listener().live_threads(), 0);
}

#[test]
fn listener_failure_fails_the_start() {
    let first = EchoService::build(&config(1, "5s")).unwrap();
    let runner = start(&first);
    let taken = first.local_addr().unwrap();

    let mut clash = config(1, "5s");
    clash.server.listen = taken;
    let second = EchoService::build(&clash).unwrap();
    let err = second.run().unwrap_err();
    assert!(matches!(err, subsys::RuntimeError::StartFailed { .. }));
    assert_tree_state(second.server().subsystem(), SubsystemState::Idling);

    first.shutdown_handle().shutdown().unwrap();
    runner.join().unwrap().unwrap();
}
