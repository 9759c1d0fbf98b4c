diesel::table! {
    reset_states (id) {
        id -> Integer,
        task_id -> Integer,
        model_key -> Text,
        last_trigger_token -> Nullable<Text>,
        last_trigger_at -> Nullable<BigInt>,
        last_observed_percent -> Nullable<Double>,
    }
}
