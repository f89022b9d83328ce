// Trellis schema - KPI tree, completion log, and progress cache tables for Diesel ORM

diesel::table! {
    schema_versions (id) {
        id -> Integer,
        version -> Text,
        name -> Text,
        features -> Text,
        introduced_at -> Text,
    }
}

diesel::table! {
    visions (id) {
        id -> Integer,
        change_id -> Text,
        title -> Text,
        description -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    kpi_nodes (id) {
        id -> Integer,
        change_id -> Text,
        vision_id -> Integer,
        parent_kpi_id -> Nullable<Integer>,
        level -> Text,
        title -> Text,
        description -> Nullable<Text>,
        weight -> Double,
        target_value -> Nullable<Double>,
        target_date -> Nullable<Text>,
        period_start -> Nullable<Text>,
        period_end -> Nullable<Text>,
        is_active -> Bool,
        sort_order -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    completion_logs (id) {
        id -> Integer,
        kpi_id -> Integer,
        log_date -> Text,
        completed -> Bool,
        value -> Nullable<Double>,
        logged_at -> Text,
    }
}

// One row per KPI, denormalized for O(1) reads. row_version backs the
// compare-and-swap write discipline in recalc.
diesel::table! {
    progress_cache (id) {
        id -> Integer,
        kpi_id -> Integer,
        progress_percentage -> Double,
        status -> Text,
        child_count -> Integer,
        completed_child_count -> Integer,
        calculation_method -> Text,
        manual_override_reason -> Nullable<Text>,
        formula_json -> Nullable<Text>,
        row_version -> Integer,
        last_calculated_at -> Text,
    }
}

// One row per (kpi, ISO week) marks that week's streak recovery as used.
diesel::table! {
    streak_recoveries (id) {
        id -> Integer,
        kpi_id -> Integer,
        iso_year -> Integer,
        iso_week -> Integer,
        gap_date -> Text,
        recovered_on -> Text,
    }
}

diesel::joinable!(progress_cache -> kpi_nodes (kpi_id));

diesel::allow_tables_to_appear_in_same_query!(kpi_nodes, progress_cache);
