//! Namespace and network coordination on top of `boot-net`.

use boot_net::{NetworkConfig, NetworkError, NetworkStack};
use tracing::{error, info};

use crate::context::{BootContext, BootEnv, Namespace};
use crate::error::{Stage, StageError, StageResult};
use crate::fsutil;

/// Operations the boot pipeline needs from the network capability stack.
pub trait NetworkEnvironment {
    fn build_namespaces(&mut self) -> boot_net::Result<()>;
    fn enter_namespace(&mut self, namespace: Namespace) -> boot_net::Result<()>;
    fn bring_up_common(&mut self) -> boot_net::Result<()>;
    fn forward_ports(&mut self) -> boot_net::Result<()>;
    fn bring_up_mobile(&mut self) -> boot_net::Result<()>;
}

/// Builds the capability stack once the minimal environment exists.
pub trait NetworkFactory {
    fn create(&self, config: &NetworkConfig) -> boot_net::Result<Box<dyn NetworkEnvironment>>;
}

#[derive(Debug, Default)]
pub struct StackFactory;

impl NetworkFactory for StackFactory {
    fn create(&self, config: &NetworkConfig) -> boot_net::Result<Box<dyn NetworkEnvironment>> {
        Ok(Box::new(NetworkStack::new(config.clone())?))
    }
}

impl NetworkEnvironment for NetworkStack {
    fn build_namespaces(&mut self) -> boot_net::Result<()> {
        self.create_namespaces()
    }

    fn enter_namespace(&mut self, namespace: Namespace) -> boot_net::Result<()> {
        let name = match namespace {
            Namespace::Outer => self.config().outer_namespace.clone(),
            Namespace::Guest => self.config().guest_namespace.clone(),
        };
        self.switch_namespace(&name)
    }

    fn bring_up_common(&mut self) -> boot_net::Result<()> {
        self.configure_network_common()
    }

    fn forward_ports(&mut self) -> boot_net::Result<()> {
        self.configure_port_forwarding()
    }

    fn bring_up_mobile(&mut self) -> boot_net::Result<()> {
        self.configure_network_mobile()
    }
}

/// Owns the network stack and is the only code that moves the process
/// between namespaces.
pub struct NetworkCoordinator {
    network: Box<dyn NetworkEnvironment>,
    namespaces_created: bool,
}

impl NetworkCoordinator {
    pub fn create(factory: &dyn NetworkFactory, config: &NetworkConfig) -> StageResult<Self> {
        let network = factory.create(config).map_err(|e| {
            error!(error = %e, "failed to create network capabilities");
            let cause = match &e {
                NetworkError::Capability { capability, .. } => {
                    format!("Unable to create {capability}.")
                }
                _ => "Unable to create network capabilities.".to_string(),
            };
            StageError::new(Stage::CreateManagers, cause)
        })?;
        Ok(Self {
            network,
            namespaces_created: false,
        })
    }

    pub fn create_namespaces(&mut self) -> StageResult {
        self.network.build_namespaces().map_err(|e| {
            error!(error = %e, "failed to create namespaces");
            StageError::new(Stage::CreateNamespaces, "Could not create namespaces.")
        })?;
        self.namespaces_created = true;
        Ok(())
    }

    /// Moves the process into `namespace` and records it in `ctx`.
    pub fn pivot(&mut self, ctx: &mut BootContext, namespace: Namespace) -> StageResult {
        let pivot_failed =
            || StageError::new(Stage::PivotNamespace, "Could not pivot to a different namespace.");
        if !self.namespaces_created {
            error!(%namespace, "pivot requested before namespaces were created");
            return Err(pivot_failed());
        }
        self.network.enter_namespace(namespace).map_err(|e| {
            error!(%namespace, error = %e, "namespace switch failed");
            pivot_failed()
        })?;
        ctx.set_current_namespace(namespace);
        info!(%namespace, "switched network namespace");
        Ok(())
    }

    pub fn configure_common(&mut self, env: BootEnv<'_>, ctx: &BootContext) -> StageResult {
        ctx.require_namespace(Namespace::Outer, Stage::ConfigureNetwork)?;

        let env_dir = env.paths.resolve(&env.config.network.interface_env_dir);
        fsutil::prepare_dir(&env_dir, 0o755).map_err(|e| {
            error!(path = %env_dir.display(), error = %e, "failed to create interface env dir");
            StageError::new(
                Stage::ConfigureNetwork,
                "Could not create host interface env folder.",
            )
        })?;

        self.network.bring_up_common().map_err(|e| {
            error!(error = %e, "common network configuration failed");
            StageError::new(Stage::ConfigureNetwork, "Failed to configure common network.")
        })?;

        if ctx.nested_vm {
            self.network.forward_ports().map_err(|e| {
                error!(error = %e, "port forwarding failed");
                StageError::new(Stage::ConfigureNetwork, "Failed to configure port forwarding.")
            })?;
        }
        Ok(())
    }

    /// Adds the radio link. Runs after the process has moved to the guest
    /// namespace; the stack addresses the outer side by name.
    pub fn configure_mobile(&mut self, ctx: &BootContext) -> StageResult {
        ctx.require_namespace(Namespace::Guest, Stage::ConfigureMobileNetwork)?;
        info!("configuring mobile network");
        self.network.bring_up_mobile().map_err(|e| {
            error!(error = %e, "mobile network configuration failed");
            StageError::new(
                Stage::ConfigureMobileNetwork,
                "Failed to configure mobile network.",
            )
        })
    }
}
