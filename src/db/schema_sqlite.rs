diesel::table! {
    channels (id) {
        id -> Integer,
        remote_name -> Text,
        matrix_room_id -> Text,
        is_direct -> Bool,
        remote_id -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    virtual_users (id) {
        id -> Integer,
        username -> Text,
        matrix_token -> Text,
        matrix_id -> Text,
        remote_id -> Text,
        registered -> Bool,
        created_at -> Text,
    }
}

diesel::table! {
    channel_members (id) {
        id -> Integer,
        channel_id -> Text,
        matrix_id -> Text,
        joined -> Bool,
    }
}

diesel::table! {
    bridge_info (id) {
        id -> Integer,
        account_prefix -> Text,
        remote_protocol -> Text,
        avatar_url -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(channels, virtual_users, channel_members, bridge_info);
