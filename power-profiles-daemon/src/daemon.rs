/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{anyhow, ensure, Result};
use std::env;
use std::sync::Arc;
use tokio::net::UnixDatagram;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};
use zbus::connection::Builder;

use crate::bus::{
    acquire_names, export_interfaces, BusRelayService, InterfaceContext, PropertySnapshot,
    SharedProperties,
};
use crate::manager::ProfileManager;
use crate::polkit::PolicyGate;
use crate::Service;

pub(crate) struct Daemon {
    services: JoinSet<Result<()>>,
    token: CancellationToken,
    notify_socket: NotifySocket,
}

#[derive(Default)]
struct NotifySocket {
    socket: Option<UnixDatagram>,
}

impl NotifySocket {
    async fn setup_socket(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let Some(notify_socket) = env::var_os("NOTIFY_SOCKET") else {
            return Ok(());
        };
        let socket = UnixDatagram::unbound()?;
        socket.connect(notify_socket)?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn notify(&mut self, message: &str) {
        if let Err(e) = self.setup_socket().await {
            warn!("Couldn't set up systemd notify socket: {e}");
            return;
        }
        let Some(ref socket) = self.socket else {
            return;
        };
        trace!("Sending message to systemd: {message}");
        if let Err(e) = socket.send(message.as_bytes()).await {
            warn!("Couldn't notify systemd: {e}");
        }
    }
}

impl Daemon {
    fn new() -> Daemon {
        Daemon {
            services: JoinSet::new(),
            token: CancellationToken::new(),
            notify_socket: NotifySocket::default(),
        }
    }

    fn add_service<S: Service + 'static>(&mut self, service: S) -> CancellationToken {
        let token = self.token.child_token();
        let moved_token = token.clone();
        self.services
            .spawn(async move { service.start(moved_token).await });
        token
    }

    async fn run(&mut self) -> Result<()> {
        ensure!(
            !self.services.is_empty(),
            "Can't run a daemon with no services attached."
        );

        self.notify_socket.notify("READY=1\n").await;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;

        // Any service finishing, cleanly or not, takes the daemon down
        let mut res = tokio::select! {
            e = self.services.join_next() => match e {
                Some(Ok(res)) => res,
                Some(Err(e)) => Err(e.into()),
                None => Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Got SIGINT, shutting down");
                Ok(())
            }
            e = sigterm.recv() => match e {
                Some(()) => {
                    info!("Got SIGTERM, shutting down");
                    Ok(())
                }
                None => Err(anyhow!("SIGTERM pipe broke")),
            },
            _ = sigquit.recv() => Err(anyhow!("Got SIGQUIT")),
        };
        self.token.cancel();
        self.notify_socket.notify("STOPPING=1\n").await;

        info!("Shutting down");

        while let Some(service_res) = self.services.join_next().await {
            res = match service_res {
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
                _ => continue,
            };
        }

        res
    }
}

/// Bring the daemon up and run it until shutdown. Any error out of here
/// means startup failed and the process exits with status 1.
pub async fn run(replace: bool) -> Result<()> {
    let connection = Builder::system()?.build().await?;

    let props: SharedProperties = Arc::new(RwLock::new(PropertySnapshot::default()));
    let (commands_tx, commands_rx) = unbounded_channel();
    let (notify_tx, notify_rx) = unbounded_channel();

    let gate = Arc::new(PolicyGate::new(&connection).await?);
    let ctx = InterfaceContext::new(props.clone(), commands_tx.clone(), gate);
    export_interfaces(&connection, ctx).await?;
    acquire_names(&connection, replace).await?;

    let mut manager = ProfileManager::new(
        Some(connection.clone()),
        props,
        commands_rx,
        notify_tx,
    );
    manager.start_up().await?;

    let relay = BusRelayService::new(connection.clone(), notify_rx, commands_tx);

    let mut daemon = Daemon::new();
    daemon.add_service(manager);
    daemon.add_service(relay);
    daemon.run().await
}
