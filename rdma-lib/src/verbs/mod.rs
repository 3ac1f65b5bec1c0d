mod verbs_devinfo;
mod verbs_provider;
mod verbs_util;

pub use verbs_devinfo::VerbsDeviceList;
pub use verbs_provider::{
    VerbsCmId, VerbsCompChannel, VerbsContext, VerbsCq, VerbsEventChannel, VerbsMr, VerbsPd,
    VerbsProvider, VerbsQp,
};
