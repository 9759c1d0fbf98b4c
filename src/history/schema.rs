diesel::table! {
    wakeup_history (id) {
        id -> Integer,
        timestamp -> BigInt,
        trigger_type -> Text,
        trigger_source -> Text,
        task_name -> Text,
        account_id -> Text,
        account_email -> Text,
        model_id -> Text,
        prompt -> Text,
        success -> Bool,
        message -> Text,
        duration_ms -> BigInt,
    }
}
