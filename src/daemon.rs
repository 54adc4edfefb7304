//! Daemon - the backend service
//!
//! Wires the store, the MQTT bridge, the job queues and their workers, then
//! runs until interrupted.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::db::{self, DbPool};
use crate::devices::{DeviceEvent, DeviceRegistry};
use crate::hardware::{Hardware, HardwareClient, SimulatedHardware};
use crate::motion::{MotorWorker, QueuedMotorDriver};
use crate::mqtt::{
    self, ConnectionState, MqttBridge, RumqttTransport, ServerAnnouncement, Topics,
};
use crate::orders::{Dispenser, IntakeWorker, PrepareWorker};
use crate::peripherals::{PeripheralCommandWorker, PeripheralService};
use crate::queue::{
    ALL_QUEUES, INTAKE_QUEUE, JobQueue, MOTOR_QUEUE, PERIPHERAL_QUEUE, PREPARE_QUEUE, WorkerPool,
};
use crate::{Config, Result};

/// The granel backend daemon
pub struct Daemon {
    config: Config,
    db: DbPool,
    hardware: Arc<dyn Hardware>,
}

impl Daemon {
    /// Create a daemon on the configured database with the simulated machine
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or migrated
    pub fn new(config: Config) -> Result<Self> {
        let db = db::init(&config.db_path)?;
        let hardware = Arc::new(SimulatedHardware::new(config.hardware));
        Ok(Self::with_parts(config, db, hardware))
    }

    /// Create a daemon from already constructed parts
    #[must_use]
    pub fn with_parts(config: Config, db: DbPool, hardware: Arc<dyn Hardware>) -> Self {
        Self {
            config,
            db,
            hardware,
        }
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if startup fails
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                signal.cancel();
            }
        });

        self.run_until(shutdown).await
    }

    /// Run until `shutdown` is cancelled, then drain workers and disconnect
    ///
    /// # Errors
    ///
    /// Returns error if stalled jobs cannot be recovered at startup
    #[allow(clippy::too_many_lines)]
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            config,
            db,
            hardware,
        } = self;

        for name in ALL_QUEUES {
            JobQueue::new(name, db.clone()).recover_stalled()?;
        }

        // Broker connection
        let registry = DeviceRegistry::new(db.clone());
        let announcement = ServerAnnouncement {
            address: config
                .server
                .address
                .clone()
                .unwrap_or_else(mqtt::detect_local_ip),
            port: config.server.port,
        };
        let options = mqtt::client_options(&config.mqtt, &mqtt::client_id());
        let (transport, eventloop) = RumqttTransport::new(options);
        let client = transport.client().clone();
        let bridge = Arc::new(MqttBridge::new(
            Arc::new(transport),
            registry.clone(),
            Topics::new(&config.mqtt.topic_prefix),
            config.timeouts,
            announcement,
        ));

        let mqtt_shutdown = CancellationToken::new();
        let state_log = tokio::spawn(log_connection_state(
            bridge.watch_state(),
            mqtt_shutdown.clone(),
        ));
        let event_loop = tokio::spawn(mqtt::run_event_loop(
            Arc::clone(&bridge),
            eventloop,
            client,
            config.mqtt.reconnect_period,
            mqtt_shutdown.clone(),
        ));
        tracing::info!(
            host = %config.mqtt.host,
            port = config.mqtt.port,
            tls = config.mqtt.use_tls,
            "connecting to MQTT broker"
        );

        // Peripheral feedback reaches the store even without a waiting caller
        let peripheral_queue = JobQueue::new(PERIPHERAL_QUEUE, db.clone());
        let peripherals = PeripheralService::new(
            db.clone(),
            registry.clone(),
            Arc::clone(&bridge),
            peripheral_queue.clone(),
        );
        bridge.set_config_feedback_handler(peripherals.feedback_handler());

        // Pipeline
        let queues = &config.queues;
        let intake_queue = JobQueue::new(INTAKE_QUEUE, db.clone());
        let prepare_queue = JobQueue::new(PREPARE_QUEUE, db.clone());
        let motor_queue = JobQueue::new(MOTOR_QUEUE, db.clone());

        let hardware = HardwareClient::new(hardware);
        let dispenser = Dispenser::new(
            Arc::new(QueuedMotorDriver::new(
                motor_queue.clone(),
                queues.motor_wait_timeout,
            )),
            hardware.clone(),
            config.dispense,
            Arc::new(Mutex::new(())),
        );

        let motor_pool = WorkerPool::spawn(
            motor_queue,
            Arc::new(MotorWorker::new(hardware)),
            queues.motor_concurrency,
            queues.poll_interval,
        );
        let peripheral_pool = WorkerPool::spawn(
            peripheral_queue,
            Arc::new(PeripheralCommandWorker::new(Arc::clone(&bridge))),
            queues.peripheral_concurrency,
            queues.poll_interval,
        );
        let prepare_pool = WorkerPool::spawn(
            prepare_queue.clone(),
            Arc::new(PrepareWorker::new(dispenser)),
            queues.prepare_concurrency,
            queues.poll_interval,
        );
        let intake_pool = WorkerPool::spawn(
            intake_queue,
            Arc::new(IntakeWorker::new(prepare_queue)),
            queues.intake_concurrency,
            queues.poll_interval,
        );

        let device_log = tokio::spawn(log_device_events(
            registry.subscribe(),
            shutdown.clone(),
        ));

        tracing::info!(
            server_port = config.server.port,
            prefix = %config.mqtt.topic_prefix,
            "granel backend ready"
        );
        shutdown.cancelled().await;

        // Upstream stages stop first so running orders can still move motors
        intake_pool.shutdown().await;
        prepare_pool.shutdown().await;
        peripheral_pool.shutdown().await;
        motor_pool.shutdown().await;

        mqtt_shutdown.cancel();
        if let Err(e) = event_loop.await {
            tracing::error!(error = %e, "MQTT event loop task failed");
        }
        if let Err(e) = state_log.await {
            tracing::error!(error = %e, "connection state task failed");
        }
        if let Err(e) = device_log.await {
            tracing::error!(error = %e, "device event task failed");
        }

        tracing::info!("daemon stopped");
        Ok(())
    }
}

async fn log_connection_state(
    mut state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
) {
    loop {
        let changed = tokio::select! {
            () = shutdown.cancelled() => break,
            changed = state.changed() => changed,
        };
        if changed.is_err() {
            break;
        }

        let current = *state.borrow_and_update();
        tracing::debug!(state = ?current, "MQTT connection state changed");
    }
}

async fn log_device_events(
    mut events: broadcast::Receiver<DeviceEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(DeviceEvent::Connected(device)) => {
                tracing::info!(device = %device.uuid, ip = ?device.ip, board = %device.board_name, "device connected");
            }
            Ok(DeviceEvent::Updated(device)) => {
                tracing::debug!(device = %device.uuid, ip = ?device.ip, "device refreshed");
            }
            Ok(DeviceEvent::Disconnected { uuid }) => {
                tracing::info!(device = %uuid, "device disconnected");
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "device event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
