//! Module pipeline: an ordered chain of optional per-connection handlers with
//! replace/drop/pass-through semantics, dispatched through a closed action enum and a
//! construction-time `(direction, packet_name)` table rather than runtime duck typing.
//!
//! This is how the chunk-cache module plugs onto the external side's clientbound path.

use bytes::Bytes;

/// The direction a packet is travelling relative to the endpoint a module is mounted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerDirection {
    /// A packet arriving at this endpoint.
    Recv,
    /// A packet about to be written out from this endpoint.
    Send,
}

/// The outcome of dispatching a packet event to a module's handler.
#[derive(Debug, Clone)]
pub enum PacketAction {
    /// Forward the original packet unchanged.
    Pass,
    /// Substitute a different packet (name and payload).
    Replace(&'static str, Bytes),
    /// Suppress the packet entirely.
    Drop,
}

/// A module mounted on a connection's pipeline. Handlers are keyed by `(direction, packet_name)`
/// at construction time, rather than by runtime duck-typed method lookup.
pub trait Module: Send {
    /// Called once per lifecycle event; every module in the chain is invoked, in order, with no
    /// return value influencing dispatch.
    fn on_connect(&mut self) {}

    /// Called once per lifecycle event, mirroring [`Module::on_connect`].
    fn on_disconnect(&mut self) {}

    /// Whether this module declares a handler for `(direction, packet_name)`. Modules that return
    /// `false` are skipped for this packet without consulting [`Module::handle`] as the module
    /// chain's "first declared handler wins" rule requires a cheap way to check for a match before
    /// committing to a dispatch.
    fn handles(&self, direction: HandlerDirection, packet_name: &str) -> bool;

    /// Handles one packet event. Only called when [`Module::handles`] returned `true`. May queue
    /// extra outbound packets via the returned `extra` vector, for modules that need to inject a
    /// packet of their own alongside (or instead of) handling the one they were given.
    fn handle(
        &mut self,
        direction: HandlerDirection,
        packet_name: &str,
        payload: &Bytes,
    ) -> (PacketAction, Vec<(&'static str, Bytes)>);
}

/// Ordered list of modules mounted on one connection endpoint: for packet events, the first
/// module in order with a matching handler wins.
#[derive(Default)]
pub struct ModulePipeline {
    modules: Vec<Box<dyn Module>>,
}

impl ModulePipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Appends a module to the end of the chain.
    pub fn push(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    /// Invokes `on_connect` on every module, in order.
    pub fn connect(&mut self) {
        for module in &mut self.modules {
            module.on_connect();
        }
    }

    /// Invokes `on_disconnect` on every module, in order.
    pub fn disconnect(&mut self) {
        for module in &mut self.modules {
            module.on_disconnect();
        }
    }

    /// Dispatches a packet event to the first module that declares a matching handler. Returns
    /// `PacketAction::Pass` with no extra packets if no module claims the packet.
    pub fn dispatch(
        &mut self,
        direction: HandlerDirection,
        packet_name: &str,
        payload: &Bytes,
    ) -> (PacketAction, Vec<(&'static str, Bytes)>) {
        for module in &mut self.modules {
            if module.handles(direction, packet_name) {
                return module.handle(direction, packet_name, payload);
            }
        }
        (PacketAction::Pass, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DropsPing;

    impl Module for DropsPing {
        fn handles(&self, direction: HandlerDirection, packet_name: &str) -> bool {
            direction == HandlerDirection::Send && packet_name == "ping"
        }

        fn handle(
            &mut self,
            _direction: HandlerDirection,
            _packet_name: &str,
            _payload: &Bytes,
        ) -> (PacketAction, Vec<(&'static str, Bytes)>) {
            (PacketAction::Drop, Vec::new())
        }
    }

    #[test]
    fn first_matching_module_wins() {
        let mut pipeline = ModulePipeline::new();
        pipeline.push(Box::new(DropsPing));

        let (action, extra) = pipeline.dispatch(HandlerDirection::Send, "ping", &Bytes::new());
        assert!(matches!(action, PacketAction::Drop));
        assert!(extra.is_empty());
    }

    #[test]
    fn unclaimed_packet_passes_through() {
        let mut pipeline = ModulePipeline::new();
        pipeline.push(Box::new(DropsPing));

        let (action, _) = pipeline.dispatch(HandlerDirection::Send, "chunk_data", &Bytes::new());
        assert!(matches!(action, PacketAction::Pass));
    }
}
