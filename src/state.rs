use std::sync::Arc;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::hub::Hub;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub hub: Hub,
    pub dispatcher: Dispatcher,
}
