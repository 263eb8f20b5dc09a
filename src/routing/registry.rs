use std::collections::HashMap;

use tracing::{debug, info};

use super::{Destination, RouteOutcome, RoutingError};
use crate::error::ErrorKind;
use crate::state_machine::{QuarantineKind, Stage, UnitEvent, UnitState, UnitStateMachine};

/// An immutable routing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub next_state: UnitState,
    pub destination: Destination,
}

impl Route {
    pub fn new(next_state: UnitState, destination: Destination) -> Self {
        Self {
            next_state,
            destination,
        }
    }

    /// Route into the processing area for the stage that commits `next_state`
    pub fn processing(next_state: UnitState) -> Self {
        let stage = Stage::producing(next_state).unwrap_or(Stage::Classify);
        Self::new(next_state, Destination::Processing(stage))
    }

    pub fn quarantine(kind: QuarantineKind) -> Self {
        Self::new(UnitState::Quarantined(kind), Destination::Quarantine(kind))
    }

    /// Stage that must run to take the unit along this route, if any
    pub fn stage(&self) -> Option<Stage> {
        match self.destination {
            Destination::Processing(stage) => Some(stage),
            _ => None,
        }
    }

    /// Event the state machine applies when this route is taken
    pub fn event(&self) -> Option<UnitEvent> {
        match self.next_state {
            UnitState::Quarantined(kind) => Some(UnitEvent::Quarantine(kind)),
            state => Stage::producing(state).map(UnitEvent::completion_of),
        }
    }
}

/// Validated, immutable `(state, outcome) -> route` table
#[derive(Debug, Clone)]
pub struct RoutingRegistry {
    routes: HashMap<(UnitState, RouteOutcome), Route>,
}

impl RoutingRegistry {
    /// Outcomes that can occur while a unit is in `state`
    ///
    /// Terminal states produce no outcomes. Every live state can fail with
    /// any error kind and can be sent back for reclassification.
    pub fn declared_outcomes(state: UnitState) -> Vec<RouteOutcome> {
        use RouteOutcome::*;

        let mut outcomes = match state {
            UnitState::Input => vec![Admitted],
            UnitState::Classified => vec![
                ArchivesPresent,
                ConversionRequired,
                Dominant,
                Mixed,
                Empty,
                Ambiguous,
            ],
            UnitState::Extracted | UnitState::Converted => vec![StageCompleted],
            UnitState::Normalized => vec![Dominant, Mixed, Empty, Ambiguous],
            UnitState::Ready | UnitState::Quarantined(_) => return Vec::new(),
        };
        outcomes.push(RequiresReclassification);
        outcomes.extend(ErrorKind::ALL.into_iter().map(Failed));
        outcomes
    }

    /// The production routing table
    pub fn standard() -> Result<Self, RoutingError> {
        let classify = Route::processing(UnitState::Classified);
        let normalize = Route::processing(UnitState::Normalized);

        let mut builder = RoutingRegistryBuilder::new()
            .route(UnitState::Input, RouteOutcome::Admitted, classify)
            .route(
                UnitState::Classified,
                RouteOutcome::ArchivesPresent,
                Route::processing(UnitState::Extracted),
            )
            .route(
                UnitState::Classified,
                RouteOutcome::ConversionRequired,
                Route::processing(UnitState::Converted),
            )
            .route(UnitState::Classified, RouteOutcome::Dominant, normalize)
            .route(UnitState::Classified, RouteOutcome::Mixed, normalize)
            .route(UnitState::Extracted, RouteOutcome::StageCompleted, classify)
            .route(UnitState::Converted, RouteOutcome::StageCompleted, normalize)
            .route(
                UnitState::Normalized,
                RouteOutcome::Dominant,
                Route::new(UnitState::Ready, Destination::Ready),
            )
            .route(
                UnitState::Normalized,
                RouteOutcome::Mixed,
                Route::new(UnitState::Ready, Destination::ReadyMixed),
            );

        for state in [UnitState::Classified, UnitState::Normalized] {
            builder = builder
                .route(state, RouteOutcome::Empty, Route::quarantine(QuarantineKind::Empty))
                .route(
                    state,
                    RouteOutcome::Ambiguous,
                    Route::quarantine(QuarantineKind::Ambiguous),
                );
        }

        for state in UnitState::all().into_iter().filter(|s| !s.is_terminal()) {
            builder = builder.route(state, RouteOutcome::RequiresReclassification, classify);
            for kind in ErrorKind::ALL {
                builder = builder.route(
                    state,
                    RouteOutcome::Failed(kind),
                    Route::quarantine(QuarantineKind::from(kind)),
                );
            }
        }

        builder.build()
    }

    /// Pure lookup of the route for a unit's current state and outcome
    pub fn resolve(&self, state: UnitState, outcome: RouteOutcome) -> Result<Route, RoutingError> {
        self.routes
            .get(&(state, outcome))
            .copied()
            .ok_or_else(|| RoutingError::Unrouted {
                state: state.to_string(),
                outcome: outcome.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Collects routes and validates them into a [`RoutingRegistry`]
#[derive(Debug, Default)]
pub struct RoutingRegistryBuilder {
    entries: Vec<(UnitState, RouteOutcome, Route)>,
}

impl RoutingRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, state: UnitState, outcome: RouteOutcome, route: Route) -> Self {
        self.entries.push((state, outcome, route));
        self
    }

    /// Reject duplicates, undeclared pairs, unreachable targets and coverage gaps
    pub fn build(self) -> Result<RoutingRegistry, RoutingError> {
        let mut routes = HashMap::with_capacity(self.entries.len());

        for (state, outcome, route) in self.entries {
            if !RoutingRegistry::declared_outcomes(state).contains(&outcome) {
                return Err(RoutingError::UndeclaredRoute {
                    state: state.to_string(),
                    outcome: outcome.to_string(),
                });
            }
            validate_target(state, outcome, &route)?;

            if routes.insert((state, outcome), route).is_some() {
                return Err(RoutingError::DuplicateRoute {
                    state: state.to_string(),
                    outcome: outcome.to_string(),
                });
            }
        }

        for state in UnitState::all() {
            for outcome in RoutingRegistry::declared_outcomes(state) {
                if !routes.contains_key(&(state, outcome)) {
                    return Err(RoutingError::MissingRoute {
                        state: state.to_string(),
                        outcome: outcome.to_string(),
                    });
                }
            }
        }

        info!(routes = routes.len(), "🧭 Routing registry validated");
        Ok(RoutingRegistry { routes })
    }
}

fn validate_target(state: UnitState, outcome: RouteOutcome, route: &Route) -> Result<(), RoutingError> {
    let unreachable = || RoutingError::UnreachableTarget {
        state: state.to_string(),
        outcome: outcome.to_string(),
        target: format!("{} @ {}", route.next_state, route.destination),
    };

    let destination_matches = match route.destination {
        Destination::Processing(stage) => Stage::producing(route.next_state) == Some(stage),
        Destination::Ready | Destination::ReadyMixed => route.next_state == UnitState::Ready,
        Destination::Quarantine(kind) => route.next_state == UnitState::Quarantined(kind),
    };
    if !destination_matches {
        return Err(unreachable());
    }

    let event = route.event().ok_or_else(unreachable)?;
    match UnitStateMachine::table_target(state, &event) {
        Ok(target) if target == route.next_state => {
            debug!(%state, %outcome, next_state = %route.next_state, "Route validated");
            Ok(())
        }
        _ => Err(unreachable()),
    }
}
