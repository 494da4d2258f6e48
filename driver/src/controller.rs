//! Máquina de estados del driver: reacciona a eventos de ciclo de vida de los
//! tasks, muta la topología y deja en el outbox los mensajes de control que hay
//! que enviar. No hace I/O; el loop de `service` se encarga de despacharlos.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    ControlPayload, DriverConfig, Epoch, GroupCommError, GroupId, GroupState, GroupStatus,
    MemberStatus, Message, OperatorSpec, RegistrationResponse, Result, Sequencer, TaskId,
    TaskStatus, TopologyShape, TopologySnapshot,
};
use tracing::{debug, info, warn};

use crate::topology::{Registration, Removal, RemovalReason, Topology};

/// Grado de salida cuando el grupo no pide una forma explícita.
pub const DEFAULT_FAN_OUT: usize = 2;

#[derive(Debug, Clone, Default)]
struct MemberMeta {
    acked_epoch: Option<Epoch>,
    last_seen: Option<Instant>,
    last_seen_at: Option<DateTime<Utc>>,
}

impl MemberMeta {
    fn touch(&mut self, now: Instant) {
        self.last_seen = Some(now);
        self.last_seen_at = Some(Utc::now());
    }
}

struct GroupEntry {
    topology: Topology,
    snapshot: Arc<TopologySnapshot>,
    operators: Vec<OperatorSpec>,
    members: HashMap<TaskId, MemberMeta>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl GroupEntry {
    fn refresh(&mut self) {
        self.snapshot = self.topology.snapshot();
        self.updated_at = Utc::now();
    }
}

pub struct GroupCommDriver {
    config: DriverConfig,
    groups: HashMap<GroupId, GroupEntry>,
    sequencer: Sequencer,
    outbox: Vec<Message>,
}

impl GroupCommDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            groups: HashMap::new(),
            sequencer: Sequencer::new(),
            outbox: Vec::new(),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Mensajes de control pendientes de envío, en el orden en que se generaron.
    pub fn drain_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.groups.keys().cloned().collect();
        ids.sort();
        ids
    }

    /* ---------------- creación ---------------- */

    /// Crea un grupo con sus miembros esperados y sus operadores.
    ///
    /// Todos los operadores del grupo comparten la raíz: el emisor de
    /// Broadcast/Scatter y el receptor de Reduce/Gather son el mismo task.
    /// Un grupo irrecuperable con el mismo id se reemplaza.
    pub fn create_group(
        &mut self,
        group_id: &str,
        members: &[TaskId],
        shape: Option<TopologyShape>,
        operators: Vec<OperatorSpec>,
    ) -> Result<Arc<TopologySnapshot>> {
        if let Some(existing) = self.groups.get(group_id) {
            if existing.topology.state() != GroupState::Unrecoverable {
                return Err(GroupCommError::GroupExists {
                    group_id: group_id.to_string(),
                });
            }
            info!("reemplazando grupo irrecuperable {}", group_id);
        }

        let root_id = validate_operators(group_id, &operators)?;
        let mut expected: Vec<TaskId> = members.to_vec();
        if !expected.contains(&root_id) {
            expected.insert(0, root_id.clone());
        }
        let shape =
            shape.unwrap_or_else(|| TopologyShape::for_members(expected.len(), DEFAULT_FAN_OUT));

        let topology = Topology::new(group_id, root_id.clone(), shape, &expected)?;
        let snapshot = topology.snapshot();
        let now = Utc::now();
        let members = expected
            .iter()
            .map(|m| (m.clone(), MemberMeta::default()))
            .collect();

        info!(
            "grupo {} creado: raíz {}, {} miembros, {} operadores, forma {:?}",
            group_id,
            root_id,
            expected.len(),
            operators.len(),
            shape
        );

        self.groups.insert(
            group_id.to_string(),
            GroupEntry {
                topology,
                snapshot: Arc::clone(&snapshot),
                operators,
                members,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(snapshot)
    }

    /* ---------------- eventos de ciclo de vida ---------------- */

    pub fn task_registered(&mut self, group_id: &str, task_id: &str) -> Result<RegistrationResponse> {
        let max_attempts = self.config.max_task_attempts;
        let entry = self.live_entry_mut(group_id)?;

        let exhausted = entry
            .topology
            .node(task_id)
            .map(|n| n.status == TaskStatus::Failed && n.attempts >= max_attempts)
            .unwrap_or(false);
        if exhausted {
            let reason = format!("{task_id} agotó sus {max_attempts} intentos");
            self.abort(group_id, &reason)?;
            return Err(GroupCommError::UnrecoverableGroup {
                group_id: group_id.to_string(),
                reason,
            });
        }

        let entry = self.live_entry_mut(group_id)?;
        let registration = entry.topology.add_task(task_id)?;
        entry.refresh();
        let meta = entry.members.entry(task_id.to_string()).or_default();
        meta.acked_epoch = None;
        meta.touch(Instant::now());

        let snapshot = Arc::clone(&entry.snapshot);
        let operators = entry.operators.clone();
        let attempts = entry.topology.node(task_id).map(|n| n.attempts).unwrap_or(1);
        info!(
            "{}: task {} registrado ({:?}), epoch {}",
            group_id,
            task_id,
            registration,
            snapshot.epoch()
        );

        self.emit(
            group_id,
            task_id,
            &ControlPayload::GroupConfig {
                operators,
                topology: (*snapshot).clone(),
            },
            snapshot.epoch(),
        )?;
        if registration != Registration::First {
            self.broadcast_topology(group_id, Some(task_id))?;
        }

        Ok(RegistrationResponse {
            group_id: group_id.to_string(),
            task_id: task_id.to_string(),
            epoch: snapshot.epoch(),
            attempts,
        })
    }

    pub fn task_running(&mut self, group_id: &str, task_id: &str) -> Result<()> {
        let entry = self.live_entry_mut(group_id)?;
        if entry.topology.mark_running(task_id)? {
            debug!("{}: {} en Running", group_id, task_id);
            entry.refresh();
        }
        if let Some(meta) = entry.members.get_mut(task_id) {
            meta.touch(Instant::now());
        }
        self.check_barrier(group_id)
    }

    pub fn task_failed(&mut self, group_id: &str, task_id: &str, reason: &str) -> Result<()> {
        let entry = self.live_entry_mut(group_id)?;
        let removal = entry.topology.remove_task(task_id, RemovalReason::Failed)?;
        entry.refresh();
        warn!("{}: task {} falló: {}", group_id, task_id, reason);

        match removal {
            Removal::RootLost => {
                let reason = format!("falló la raíz {task_id}: {reason}");
                self.abort(group_id, &reason)
            }
            _ => {
                self.broadcast_topology(group_id, None)?;
                self.check_barrier(group_id)
            }
        }
    }

    pub fn task_completed(&mut self, group_id: &str, task_id: &str) -> Result<()> {
        let entry = self.live_entry_mut(group_id)?;
        entry.topology.remove_task(task_id, RemovalReason::Completed)?;
        entry.refresh();
        info!("{}: task {} completado", group_id, task_id);

        if entry.topology.is_complete() {
            info!("{}: todos los miembros terminaron, liberando el grupo", group_id);
            self.groups.remove(group_id);
        }
        Ok(())
    }

    /// Registra el último epoch confirmado por un miembro.
    pub fn task_acked(&mut self, group_id: &str, task_id: &str, epoch: Epoch) -> Result<()> {
        let entry = self.entry_mut(group_id)?;
        let meta = entry
            .members
            .get_mut(task_id)
            .ok_or_else(|| GroupCommError::UnknownMember {
                group_id: group_id.to_string(),
                task_id: task_id.to_string(),
            })?;
        if meta.acked_epoch.map_or(true, |e| epoch > e) {
            meta.acked_epoch = Some(epoch);
        }
        meta.touch(Instant::now());
        debug!("{}: {} confirmó epoch {}", group_id, task_id, epoch);
        Ok(())
    }

    /// Actualiza el último contacto de `task_id` en todos sus grupos.
    pub fn heartbeat(&mut self, task_id: &str) -> bool {
        let now = Instant::now();
        let mut known = false;
        for entry in self.groups.values_mut() {
            if let Some(meta) = entry.members.get_mut(task_id) {
                meta.touch(now);
                known = true;
            }
        }
        known
    }

    /// Miembros Running sin contacto durante más de `timeout`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<(GroupId, TaskId)> {
        let mut out = Vec::new();
        for (group_id, entry) in &self.groups {
            if entry.topology.state() == GroupState::Unrecoverable {
                continue;
            }
            for node in entry.topology.nodes() {
                if node.status != TaskStatus::Running {
                    continue;
                }
                let silent = entry
                    .members
                    .get(&node.task_id)
                    .and_then(|m| m.last_seen)
                    .map(|seen| now.saturating_duration_since(seen) > timeout)
                    .unwrap_or(true);
                if silent {
                    out.push((group_id.clone(), node.task_id.clone()));
                }
            }
        }
        out.sort();
        out
    }

    /// Declara fallidos a los miembros silenciosos.
    pub fn sweep(&mut self, now: Instant) -> Vec<(GroupId, TaskId)> {
        let expired = self.expired(now, self.config.heartbeat_timeout);
        let mut failed = Vec::new();
        for (group_id, task_id) in expired {
            match self.task_failed(&group_id, &task_id, "sin heartbeat") {
                Ok(()) => failed.push((group_id, task_id)),
                // la caída de otro miembro del mismo barrido pudo abortar el grupo
                Err(e) => debug!("barrido: no se pudo marcar {}/{}: {}", group_id, task_id, e),
            }
        }
        failed
    }

    /* ---------------- consultas ---------------- */

    pub fn snapshot(&self, group_id: &str) -> Result<Arc<TopologySnapshot>> {
        self.entry(group_id).map(|e| Arc::clone(&e.snapshot))
    }

    pub fn operators(&self, group_id: &str) -> Result<&[OperatorSpec]> {
        self.entry(group_id).map(|e| e.operators.as_slice())
    }

    pub fn status(&self, group_id: &str) -> Result<GroupStatus> {
        let entry = self.entry(group_id)?;
        let members = entry
            .topology
            .nodes()
            .map(|node| {
                let meta = entry.members.get(&node.task_id).cloned().unwrap_or_default();
                MemberStatus {
                    task_id: node.task_id.clone(),
                    parent_id: node.parent_id.clone(),
                    child_ids: node.child_ids.iter().cloned().collect(),
                    status: node.status,
                    attempts: node.attempts,
                    acked_epoch: meta.acked_epoch,
                    last_seen: meta.last_seen_at,
                }
            })
            .collect();

        Ok(GroupStatus {
            group_id: group_id.to_string(),
            state: entry.topology.state(),
            epoch: entry.topology.epoch(),
            root_id: entry.topology.root_id().to_string(),
            operators: entry.operators.iter().map(|o| o.name().to_string()).collect(),
            members,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        })
    }

    /* ---------------- internos ---------------- */

    fn entry(&self, group_id: &str) -> Result<&GroupEntry> {
        self.groups.get(group_id).ok_or_else(|| GroupCommError::UnknownGroup {
            group_id: group_id.to_string(),
        })
    }

    fn entry_mut(&mut self, group_id: &str) -> Result<&mut GroupEntry> {
        self.groups
            .get_mut(group_id)
            .ok_or_else(|| GroupCommError::UnknownGroup {
                group_id: group_id.to_string(),
            })
    }

    /// Como `entry_mut`, pero falla si el grupo ya fue abortado.
    fn live_entry_mut(&mut self, group_id: &str) -> Result<&mut GroupEntry> {
        let entry = self.entry_mut(group_id)?;
        if entry.topology.state() == GroupState::Unrecoverable {
            return Err(GroupCommError::UnrecoverableGroup {
                group_id: group_id.to_string(),
                reason: "el grupo fue abortado".to_string(),
            });
        }
        Ok(entry)
    }

    fn emit(
        &mut self,
        group_id: &str,
        destination: &str,
        payload: &ControlPayload,
        epoch: Epoch,
    ) -> Result<()> {
        let message = Message::control(group_id, destination, epoch, payload)?;
        debug!(
            "{}: {} -> {} (epoch {})",
            group_id,
            payload.variant_name(),
            destination,
            epoch
        );
        let message = self.sequencer.stamp(message);
        self.outbox.push(message);
        Ok(())
    }

    /// Envía el snapshot vigente a los miembros vivos, salvo `except`.
    fn broadcast_topology(&mut self, group_id: &str, except: Option<&str>) -> Result<()> {
        let entry = self.entry(group_id)?;
        let snapshot = Arc::clone(&entry.snapshot);
        let targets: Vec<TaskId> = entry
            .topology
            .live_members()
            .into_iter()
            .filter(|m| Some(m.as_str()) != except)
            .filter(|m| registered(entry, m))
            .collect();

        let payload = ControlPayload::TopologyUpdate {
            topology: (*snapshot).clone(),
        };
        for target in targets {
            self.emit(group_id, &target, &payload, snapshot.epoch())?;
        }
        Ok(())
    }

    /// Libera la barrera si todos los miembros vivos están Running.
    fn check_barrier(&mut self, group_id: &str) -> Result<()> {
        let entry = self.live_entry_mut(group_id)?;
        if entry.topology.state() != GroupState::Forming || !entry.topology.all_running() {
            return Ok(());
        }
        entry.topology.mark_ready();
        entry.refresh();

        let snapshot = Arc::clone(&entry.snapshot);
        let targets = entry.topology.live_members();
        info!(
            "{}: barrera liberada en epoch {} ({} miembros)",
            group_id,
            snapshot.epoch(),
            targets.len()
        );

        let payload = ControlPayload::OperatorReady {
            topology: (*snapshot).clone(),
        };
        for target in targets {
            self.emit(group_id, &target, &payload, snapshot.epoch())?;
        }
        Ok(())
    }

    fn abort(&mut self, group_id: &str, reason: &str) -> Result<()> {
        let entry = self.entry_mut(group_id)?;
        entry.topology.mark_unrecoverable();
        entry.refresh();
        let epoch = entry.topology.epoch();

        // también se avisa a los caídos: un task que vuelve no debe seguir esperando
        let targets: Vec<TaskId> = entry
            .topology
            .nodes()
            .filter(|n| n.status != TaskStatus::Completed)
            .filter(|n| registered(entry, &n.task_id))
            .map(|n| n.task_id.clone())
            .collect();
        warn!("{}: grupo irrecuperable: {}", group_id, reason);

        let payload = ControlPayload::Abort {
            reason: reason.to_string(),
        };
        for target in targets {
            self.emit(group_id, &target, &payload, epoch)?;
        }
        Ok(())
    }
}

/// Un miembro reservado que nunca se registró no tiene buzón todavía.
fn registered(entry: &GroupEntry, task_id: &str) -> bool {
    entry
        .topology
        .node(task_id)
        .map(|n| n.attempts > 0)
        .unwrap_or(false)
}

/// Valida los operadores de un grupo y devuelve la raíz común.
fn validate_operators(group_id: &str, operators: &[OperatorSpec]) -> Result<TaskId> {
    let first = operators.first().ok_or_else(|| {
        GroupCommError::invalid_spec(group_id, "", "el grupo necesita al menos un operador")
    })?;

    let mut names = HashSet::new();
    for spec in operators {
        if spec.group_id() != group_id {
            return Err(GroupCommError::invalid_spec(
                group_id,
                spec.name(),
                format!("el operador pertenece al grupo {}", spec.group_id()),
            ));
        }
        if !names.insert(spec.name()) {
            return Err(GroupCommError::invalid_spec(
                group_id,
                spec.name(),
                "nombre de operador repetido",
            ));
        }
        if spec.root_id() != first.root_id() {
            return Err(GroupCommError::invalid_spec(
                group_id,
                spec.name(),
                format!(
                    "la raíz {} no coincide con la del grupo ({})",
                    spec.root_id(),
                    first.root_id()
                ),
            ));
        }
    }
    Ok(first.root_id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ConfigFragment, MessageKind, OperatorKind};

    fn ids(ids: &[&str]) -> Vec<TaskId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn specs(group: &str, root: &str) -> Vec<OperatorSpec> {
        vec![
            OperatorSpec::builder(group, "model", OperatorKind::Broadcast)
                .sender(root)
                .build()
                .unwrap(),
            OperatorSpec::builder(group, "sum", OperatorKind::Reduce)
                .receiver(root)
                .fragment(ConfigFragment::reduce_function("sum"))
                .build()
                .unwrap(),
        ]
    }

    fn driver_with_group(members: &[&str]) -> GroupCommDriver {
        let mut driver = GroupCommDriver::new(DriverConfig::default());
        driver
            .create_group("g", &ids(members), Some(TopologyShape::Flat), specs("g", "r"))
            .unwrap();
        driver
    }

    fn start_all(driver: &mut GroupCommDriver, members: &[&str]) {
        for m in members {
            driver.task_registered("g", m).unwrap();
        }
        for m in members {
            driver.task_running("g", m).unwrap();
        }
    }

    fn payloads(messages: &[Message]) -> Vec<(String, ControlPayload)> {
        messages
            .iter()
            .map(|m| (m.destination.clone(), m.control_payload().unwrap()))
            .collect()
    }

    #[test]
    fn registro_envia_configuracion_del_grupo() {
        let mut driver = driver_with_group(&["r", "a"]);
        let resp = driver.task_registered("g", "a").unwrap();
        assert_eq!(resp.epoch, 0);
        assert_eq!(resp.attempts, 1);

        let out = driver.drain_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination, "a");
        assert_eq!(out[0].kind, MessageKind::TopologyUpdate);
        match out[0].control_payload().unwrap() {
            ControlPayload::GroupConfig { operators, topology } => {
                assert_eq!(operators.len(), 2);
                assert_eq!(topology.root_id(), "r");
            }
            other => panic!("se esperaba GroupConfig: {other:?}"),
        }
    }

    #[test]
    fn barrera_se_libera_cuando_todos_estan_running() {
        let mut driver = driver_with_group(&["r", "a", "b"]);
        for m in ["r", "a", "b"] {
            driver.task_registered("g", m).unwrap();
        }
        driver.drain_outbox();

        driver.task_running("g", "r").unwrap();
        driver.task_running("g", "a").unwrap();
        assert!(driver.drain_outbox().is_empty());
        assert_eq!(driver.snapshot("g").unwrap().state(), GroupState::Forming);

        driver.task_running("g", "b").unwrap();
        let out = payloads(&driver.drain_outbox());
        assert_eq!(out.len(), 3);
        assert!(out
            .iter()
            .all(|(_, p)| matches!(p, ControlPayload::OperatorReady { topology } if topology.is_ready())));
    }

    #[test]
    fn falla_sube_epoch_y_avisa_a_los_vivos() {
        let mut driver = driver_with_group(&["r", "a", "b"]);
        start_all(&mut driver, &["r", "a", "b"]);
        driver.drain_outbox();

        driver.task_failed("g", "b", "reportado").unwrap();
        let out = driver.drain_outbox();
        let mut dests: Vec<_> = out.iter().map(|m| m.destination.as_str()).collect();
        dests.sort();
        assert_eq!(dests, vec!["a", "r"]);
        assert!(out.iter().all(|m| m.epoch == 1));
        // sigue Ready: los vivos están todos Running
        assert_eq!(driver.snapshot("g").unwrap().state(), GroupState::Ready);
    }

    #[test]
    fn recuperacion_rearma_la_barrera() {
        let mut driver = driver_with_group(&["r", "a"]);
        start_all(&mut driver, &["r", "a"]);
        driver.task_failed("g", "a", "crash").unwrap();
        driver.drain_outbox();

        let resp = driver.task_registered("g", "a").unwrap();
        assert_eq!(resp.epoch, 2);
        assert_eq!(resp.attempts, 2);
        let out = payloads(&driver.drain_outbox());
        assert!(matches!(out[0], (ref d, ControlPayload::GroupConfig { .. }) if d == "a"));
        assert!(matches!(out[1], (ref d, ControlPayload::TopologyUpdate { .. }) if d == "r"));
        assert_eq!(driver.snapshot("g").unwrap().state(), GroupState::Forming);

        driver.task_running("g", "a").unwrap();
        assert_eq!(driver.snapshot("g").unwrap().state(), GroupState::Ready);
    }

    #[test]
    fn reintentos_agotados_abortan_el_grupo() {
        let mut driver = driver_with_group(&["r", "a"]);
        start_all(&mut driver, &["r", "a"]);
        for _ in 0..2 {
            driver.task_failed("g", "a", "crash").unwrap();
            driver.task_registered("g", "a").unwrap();
            driver.task_running("g", "a").unwrap();
        }
        driver.task_failed("g", "a", "crash").unwrap();
        driver.drain_outbox();

        let err = driver.task_registered("g", "a").unwrap_err();
        assert!(matches!(err, GroupCommError::UnrecoverableGroup { .. }));
        let out = payloads(&driver.drain_outbox());
        assert!(out.iter().any(|(d, p)| d == "r" && matches!(p, ControlPayload::Abort { .. })));
        assert_eq!(driver.status("g").unwrap().state, GroupState::Unrecoverable);
    }

    #[test]
    fn caida_de_la_raiz_aborta() {
        let mut driver = driver_with_group(&["r", "a", "b"]);
        start_all(&mut driver, &["r", "a", "b"]);
        driver.drain_outbox();

        driver.task_failed("g", "r", "crash").unwrap();
        let out = payloads(&driver.drain_outbox());
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|(_, p)| matches!(p, ControlPayload::Abort { .. })));
        assert!(matches!(
            driver.task_running("g", "a"),
            Err(GroupCommError::UnrecoverableGroup { .. })
        ));

        // un grupo abortado se puede volver a crear
        driver
            .create_group("g", &ids(&["r", "a"]), None, specs("g", "r"))
            .unwrap();
    }

    #[test]
    fn operadores_con_raices_distintas_son_invalidos() {
        let mut driver = GroupCommDriver::new(DriverConfig::default());
        let mut ops = specs("g", "r");
        ops.push(
            OperatorSpec::builder("g", "out", OperatorKind::Gather)
                .receiver("a")
                .build()
                .unwrap(),
        );
        let err = driver.create_group("g", &ids(&["r", "a"]), None, ops).unwrap_err();
        assert!(matches!(err, GroupCommError::InvalidOperatorSpec { ref operator, .. } if operator == "out"));

        let err = driver.create_group("g", &ids(&["r"]), None, vec![]).unwrap_err();
        assert!(matches!(err, GroupCommError::InvalidOperatorSpec { .. }));
    }

    #[test]
    fn grupo_duplicado_y_desconocido() {
        let mut driver = driver_with_group(&["r"]);
        assert!(matches!(
            driver.create_group("g", &ids(&["r"]), None, specs("g", "r")),
            Err(GroupCommError::GroupExists { .. })
        ));
        assert!(matches!(
            driver.task_registered("otro", "a"),
            Err(GroupCommError::UnknownGroup { .. })
        ));
    }

    #[test]
    fn raiz_se_agrega_si_no_esta_en_la_lista() {
        let mut driver = GroupCommDriver::new(DriverConfig::default());
        let snap = driver
            .create_group("g", &ids(&["a", "b"]), None, specs("g", "r"))
            .unwrap();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.parentless_count(), 1);
        assert!(snap.is_root("r"));
    }

    #[test]
    fn ack_queda_en_el_estado_del_grupo() {
        let mut driver = driver_with_group(&["r", "a"]);
        driver.task_registered("g", "a").unwrap();
        driver.task_acked("g", "a", 0).unwrap();
        driver.task_acked("g", "a", 3).unwrap();
        driver.task_acked("g", "a", 1).unwrap();

        let status = driver.status("g").unwrap();
        assert_eq!(status.member("a").unwrap().acked_epoch, Some(3));
        assert_eq!(status.member("r").unwrap().acked_epoch, None);
        assert_eq!(status.operators, ids(&["model", "sum"]));
    }

    #[test]
    fn barrido_marca_fallidos_a_los_silenciosos() {
        let mut driver = driver_with_group(&["r", "a"]);
        start_all(&mut driver, &["r", "a"]);

        let now = Instant::now();
        assert!(driver.expired(now, Duration::from_secs(20)).is_empty());

        let later = now + Duration::from_secs(60);
        assert_eq!(
            driver.expired(later, Duration::from_secs(20)),
            vec![("g".to_string(), "a".to_string()), ("g".to_string(), "r".to_string())]
        );
        assert!(driver.heartbeat("a"));
        assert!(!driver.heartbeat("desconocido"));
    }

    #[test]
    fn grupo_completo_se_libera() {
        let mut driver = driver_with_group(&["r", "a"]);
        start_all(&mut driver, &["r", "a"]);
        driver.task_completed("g", "a").unwrap();
        assert!(driver.snapshot("g").is_ok());
        driver.task_completed("g", "r").unwrap();
        assert!(matches!(
            driver.snapshot("g"),
            Err(GroupCommError::UnknownGroup { .. })
        ));
    }
}
