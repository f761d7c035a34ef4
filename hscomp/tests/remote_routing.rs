//! Router round trips over TCP between two remote service clients

use hscomp::remote::{
    ConnectionHandler, ConnectionState, DispatcherForwarder, InstanceInfo, MessageBody,
    MessageSource, RemoteMessage, RemoteMessageEvent, RemoteServer, RemoteServiceClient,
    ServiceRouter,
};
use hscomp::{
    ClientAddress, DispatcherThread, RemoteServiceConfig, ServiceAddress, ServiceManager,
    ThreadCompletion, Version, WaitTimeout,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const PATIENCE: Duration = Duration::from_secs(5);

struct Inbox {
    tx: mpsc::UnboundedSender<RemoteMessage>,
}

impl ConnectionHandler for Inbox {
    fn on_message(&self, message: &RemoteMessage) {
        let _ = self.tx.send(message.clone());
    }
}

async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<RemoteMessage>, wanted: F) -> RemoteMessage
where
    F: Fn(&MessageBody) -> bool,
{
    let search = async {
        loop {
            match rx.recv().await {
                Some(message) if wanted(&message.body) => return message,
                Some(_) => continue,
                None => panic!("inbox closed"),
            }
        }
    };
    tokio::time::timeout(PATIENCE, search)
        .await
        .expect("expected message did not arrive")
}

fn client_config(port: u16) -> RemoteServiceConfig {
    RemoteServiceConfig {
        enabled: true,
        host: "127.0.0.1".to_string(),
        port,
        retry_interval_ms: 100,
        ..RemoteServiceConfig::router()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_router_connects_service_and_client() {
    let server = RemoteServer::new(
        RemoteServiceConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..RemoteServiceConfig::router()
        },
        ServiceRouter::new(),
    );
    let addr = server.start().await.unwrap();

    // Service side collects messages directly from the client task.
    let (service_tx, mut service_rx) = mpsc::unbounded_channel();
    let service = RemoteServiceClient::tcp(
        client_config(addr.port()),
        InstanceInfo::current("thermostat", MessageSource::Service),
    );
    service.add_handler(Arc::new(Inbox { tx: service_tx }));

    // Client side receives them as events on a dispatcher thread.
    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    let inbox = DispatcherThread::new("RemoteInbox");
    inbox
        .register_handler(move |event: &RemoteMessageEvent| {
            let _ = client_tx.send(event.message.clone());
        })
        .unwrap();
    inbox.create_thread(WaitTimeout::Infinite).unwrap();
    let client = RemoteServiceClient::tcp(
        client_config(addr.port()),
        InstanceInfo::current("panel", MessageSource::Client),
    );
    client.add_handler(Arc::new(DispatcherForwarder::new(inbox.clone())));

    let service_task = service.start();
    let client_task = client.start();
    assert!(service.wait_for_state(ConnectionState::Connected, PATIENCE).await);
    assert!(client.wait_for_state(ConnectionState::Connected, PATIENCE).await);
    assert_ne!(service.cookie(), client.cookie());
    assert_eq!(server.core().instance_count(), 2);

    let version = Version::new(1, 2, 0);
    assert!(service.request_register_server(&ServiceAddress::new(
        "ControlThread",
        "Thermostat",
        "Temperature",
        version,
    )));
    assert!(client.request_register_client(&ClientAddress::new(
        "UiThread",
        "Thermostat",
        "Temperature",
        Version::new(1, 0, 0),
    )));

    let notify = next_matching(&mut client_rx, |body| {
        matches!(body, MessageBody::ServiceRegisteredNotify { .. })
    })
    .await;
    match notify.body {
        MessageBody::ServiceRegisteredNotify { address, cookie } => {
            assert_eq!(cookie, service.cookie());
            assert_eq!(address.version, version);
        }
        other => panic!("unexpected {other:?}"),
    }
    next_matching(&mut service_rx, |body| {
        matches!(body, MessageBody::ClientRegisteredNotify { .. })
    })
    .await;

    assert!(client.send(service.cookie(), MessageBody::Forward { payload: vec![7, 7] }));
    let forwarded = next_matching(&mut service_rx, |body| matches!(body, MessageBody::Forward { .. })).await;
    assert_eq!(forwarded.source(), client.cookie());
    assert_eq!(forwarded.body, MessageBody::Forward { payload: vec![7, 7] });

    service.stop();
    service_task.await.unwrap();
    next_matching(&mut client_rx, |body| {
        matches!(body, MessageBody::ServiceUnregisteredNotify { .. })
    })
    .await;
    assert!(server.policy().services().is_empty());
    assert_eq!(server.policy().clients().len(), 1);

    client.stop();
    client_task.await.unwrap();
    server.stop().await;

    inbox.shutdown_thread();
    let completion = tokio::task::spawn_blocking(move || inbox.destroy_thread(WaitTimeout::Infinite))
        .await
        .unwrap();
    assert_eq!(completion, ThreadCompletion::Completed);
}
