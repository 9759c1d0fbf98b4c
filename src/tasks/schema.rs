diesel::table! {
    wakeup_tasks (id) {
        id -> Integer,
        name -> Text,
        enabled -> Bool,
        created_at -> BigInt,
        last_run_at -> Nullable<BigInt>,
        config -> Text,
    }
}

diesel::table! {
    wakeup_settings (key) {
        key -> Text,
        value -> Text,
    }
}
