/*!
# Fleet DevKit - Doubles de test et harnais

Bibliothèque facilitant les tests du kernel et des agents sans broker :
- Stub MQTT implémentant `Publisher`
- Fixtures (rôles, configs d'apps, statuts)
- Hôtes simulés : vraie boucle de convergence sur une base d'apps en mémoire
- Notifier et hooks enregistreurs
*/

pub mod fixtures;
pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::MockMqttClient;
pub use test_utils::{RecordingHook, RecordingNotifier, SimulatedHost, TestHarness};
