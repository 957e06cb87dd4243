const VERSION_WITH_GIT: &str = concat!(
    env!("TERMBRIDGE_VERSION_LABEL"),
    " (git ",
    env!("TERMBRIDGE_GIT_SHA"),
    ", built ",
    env!("TERMBRIDGE_BUILD_TIME"),
    ")",
);
const VERSION_NO_GIT: &str = concat!(
    env!("TERMBRIDGE_VERSION_LABEL"),
    " (built ",
    env!("TERMBRIDGE_BUILD_TIME"),
    ")",
);

pub const VERSION: &str = if env!("TERMBRIDGE_GIT_SHA").is_empty() {
    VERSION_NO_GIT
} else {
    VERSION_WITH_GIT
};
