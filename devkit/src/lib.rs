/*!
# HostSync DevKit - doublures et harness pour tester la synchronisation

Bibliothèque facilitant les tests de bout en bout sans plateforme réelle :
- `FakePlatform` : API de supervision en mémoire, écritures enregistrées
- `ScriptedCollector` / `HostBuilder` : sources pilotées par le test
- `TestHarness` : sources -> merger -> updaters -> GC en une passe
*/

pub mod fake_platform;
pub mod scripted;
pub mod test_utils;

pub use fake_platform::{FakePlatform, WriteRecord};
pub use scripted::{HostBuilder, ScriptedCollector};
pub use test_utils::TestHarness;
