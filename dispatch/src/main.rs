//! Ride dispatch demo.
//!
//! Wires the configured store, then plays one passenger and two competing
//! drivers through a full ride: request, acceptance race, every trip phase
//! and completion, logging each view as it changes.

use anyhow::{Context, bail};
use ride_dispatch::config::StoreBackend;
use ride_dispatch::service::offer_for;
use ride_dispatch::session::{
    DriverAction, DriverSession, DriverSessionReducer, PassengerAction, PassengerSession,
    PassengerSessionReducer, SessionEnvironment, forward_changes,
};
use ride_dispatch::{Config, DispatchEnvironment, RideObserver, RideService};
use ride_dispatch_core::cancellation::CancellationLog;
use ride_dispatch_core::ride::NewRideRequest;
use ride_dispatch_core::status::RideStatus;
use ride_dispatch_core::types::{DriverId, Location, PassengerId, ServiceCategory};
use ride_dispatch_runtime::Store;
use ride_dispatch_runtime::metrics::MetricsServer;
use ride_dispatch_testing::{InMemoryCancellationLog, InMemoryRideStore, StaticDriverDirectory};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type PassengerStore = Store<PassengerSession, PassengerAction, SessionEnvironment, PassengerSessionReducer>;
type DriverStore = Store<DriverSession, DriverAction, SessionEnvironment, DriverSessionReducer>;

/// How long the demo waits for any single command to come back
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ride_dispatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(
        backend = ?config.store.backend,
        passenger_timeout_secs = config.timers.passenger_timeout.as_secs(),
        popup_timeout_secs = config.timers.driver_popup_timeout.as_secs(),
        osrm = config.routing.osrm_url.as_deref().unwrap_or("straight line"),
        "Configuration loaded"
    );

    let metrics_addr: SocketAddr = format!("{}:{}", config.server.metrics_host, config.server.metrics_port)
        .parse()
        .context("invalid METRICS_HOST/METRICS_PORT")?;
    let mut metrics = MetricsServer::new(metrics_addr);
    metrics.start()?;

    let drivers = [DriverId::new(), DriverId::new()];
    let env = build_environment(&config)
        .await?
        .configured(&config)
        .with_drivers(Arc::new(StaticDriverDirectory::online(&drivers)));
    let observer = RideObserver::new(Arc::clone(&env.store), Arc::clone(&env.changes), config.observer);
    let service = RideService::new(env);

    let rearmed = service.rearm_pending().await?;
    tracing::info!(rearmed, "Ride service ready");

    run_demo(&service, &observer, drivers).await?;

    service.shutdown();
    tracing::info!("Demo finished");
    Ok(())
}

async fn build_environment(config: &Config) -> anyhow::Result<DispatchEnvironment> {
    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(InMemoryRideStore::new());
            let log: Arc<dyn CancellationLog> = Arc::new(InMemoryCancellationLog::new());
            Ok(DispatchEnvironment::new(store, log))
        },
        StoreBackend::Postgres => postgres_environment(config).await,
    }
}

#[cfg(feature = "postgres")]
async fn postgres_environment(config: &Config) -> anyhow::Result<DispatchEnvironment> {
    use ride_dispatch_postgres::{PostgresCancellationLog, PostgresRideStore};

    let store = PostgresRideStore::new(&config.store.database_url, config.store.max_connections)
        .await
        .context("connecting to the ride database")?;
    store.migrate().await.context("running migrations")?;
    let log: Arc<dyn CancellationLog> = Arc::new(PostgresCancellationLog::new(store.pool().clone()));
    Ok(DispatchEnvironment::new(Arc::new(store), log))
}

#[cfg(not(feature = "postgres"))]
#[allow(clippy::unused_async)] // same shape as the feature-enabled variant
async fn postgres_environment(_config: &Config) -> anyhow::Result<DispatchEnvironment> {
    bail!("RIDE_STORE=postgres needs a build with the `postgres` feature")
}

async fn run_demo(service: &RideService, observer: &RideObserver, drivers: [DriverId; 2]) -> anyhow::Result<()> {
    let session_env = SessionEnvironment::new(service.clone());
    let passenger_id = PassengerId::new();
    let passenger: Arc<PassengerStore> = Arc::new(Store::new(
        PassengerSession::new(passenger_id),
        PassengerSessionReducer::new(),
        session_env.clone(),
    ));
    let driver_stores: Vec<Arc<DriverStore>> = drivers
        .iter()
        .map(|&driver_id| {
            Arc::new(Store::new(
                DriverSession::new(driver_id),
                DriverSessionReducer::new(),
                session_env.clone(),
            ))
        })
        .collect();

    // Request
    let created = passenger
        .send_and_wait_for(
            PassengerAction::RequestRide {
                payload: demo_payload(passenger_id),
            },
            |action| {
                matches!(
                    action,
                    PassengerAction::RideCreated { .. } | PassengerAction::RequestFailed { .. }
                )
            },
            STEP_TIMEOUT,
        )
        .await?;
    let ride = match created {
        PassengerAction::RideCreated { ride } => ride,
        PassengerAction::RequestFailed { error, .. } => bail!("ride request failed: {error}"),
        _ => bail!("unexpected passenger action"),
    };
    tracing::info!(ride_id = %ride.id, fare = %ride.estimated_fare, "Passenger is searching");

    let mut forwarders = vec![forward_changes(
        Arc::clone(&passenger),
        observer,
        ride.id,
        |ride| PassengerAction::RideChanged { ride },
    )];
    for store in &driver_stores {
        forwarders.push(forward_changes(Arc::clone(store), observer, ride.id, |ride| {
            DriverAction::RideChanged { ride }
        }));
    }

    // Both drivers see the offer and race for it
    for store in &driver_stores {
        store
            .send(DriverAction::OfferReceived { offer: offer_for(&ride) })
            .await?;
    }
    let settled = |action: &DriverAction| {
        matches!(
            action,
            DriverAction::Accepted { .. } | DriverAction::CommandFailed { .. }
        )
    };
    let (first, second) = tokio::join!(
        driver_stores[0].send_and_wait_for(DriverAction::Accept { ride_id: ride.id }, settled, STEP_TIMEOUT),
        driver_stores[1].send_and_wait_for(DriverAction::Accept { ride_id: ride.id }, settled, STEP_TIMEOUT),
    );
    let winner = match (first?, second?) {
        (DriverAction::Accepted { .. }, _) => 0,
        (_, DriverAction::Accepted { .. }) => 1,
        _ => bail!("neither driver won the ride"),
    };
    for (index, store) in driver_stores.iter().enumerate() {
        let notice = store.state(|s| s.notice.clone()).await;
        tracing::info!(driver = index, won = index == winner, ?notice, "Acceptance race settled");
    }

    // Drive the trip
    let driver = &driver_stores[winner];
    let start = Location::new(40.4200, -3.7050, "Driver start");
    for target in [
        RideStatus::DriverEnRouteToOrigin,
        RideStatus::DriverAtOrigin,
        RideStatus::TripStarted,
        RideStatus::DriverAtDestination,
        RideStatus::TripCompleted,
    ] {
        let outcome = driver
            .send_and_wait_for(
                DriverAction::Advance {
                    target,
                    position: Some(start.clone()),
                },
                |action| {
                    matches!(
                        action,
                        DriverAction::Advanced { .. } | DriverAction::CommandFailed { .. }
                    )
                },
                STEP_TIMEOUT,
            )
            .await?;
        if let DriverAction::CommandFailed { error, .. } = outcome {
            bail!("advancing to {target} failed: {error}");
        }
        service.settle().await;

        let driver_view = driver.state(|s| s.active.clone()).await;
        let passenger_view = passenger.state(|s| s.active.clone()).await;
        tracing::info!(
            status = %target,
            driver_phase = ?driver_view.as_ref().map(|v| &v.phase),
            passenger_phase = ?passenger_view.as_ref().map(|v| &v.phase),
            route_to_origin = driver_view.as_ref().is_some_and(|v| v.route_to_origin.is_some()),
            route_to_destination = driver_view.as_ref().is_some_and(|v| v.route_to_destination.is_some()),
            "Trip advanced"
        );
    }

    let stored = service.env().store.get(ride.id).await?;
    tracing::info!(
        ride_id = %stored.id,
        status = %stored.status,
        estimated = %stored.estimated_fare,
        actual = ?stored.actual_fare.map(|fare| fare.to_string()),
        version = stored.version,
        "Ride finished"
    );

    let recovered = service.recover_for_passenger(passenger_id).await?;
    tracing::info!(live_ride = recovered.is_some(), "Passenger recovery after completion");

    for forwarder in forwarders {
        if tokio::time::timeout(STEP_TIMEOUT, forwarder).await.is_err() {
            tracing::warn!("Change forwarder did not finish");
        }
    }
    passenger.shutdown(STEP_TIMEOUT).await?;
    for store in &driver_stores {
        store.shutdown(STEP_TIMEOUT).await?;
    }
    Ok(())
}

fn demo_payload(passenger_id: PassengerId) -> NewRideRequest {
    NewRideRequest {
        passenger_id,
        rider: None,
        origin: Location::new(40.4168, -3.7038, "Puerta del Sol"),
        destination: Location::new(40.4066, -3.6892, "Estacion de Atocha"),
        service_category: ServiceCategory::new("standard"),
        estimated_fare: None,
        correlation_id: None,
    }
}

