//! minimal bevy + bevy_chat_stream example.
//! - type into the prompt line, enter sends, ctrl+/ toggles the panel.
//! - the transcript text is rebuilt from every `ChatUpdated` snapshot.
//! - without `CHAT_PROJECT_ID` set, replies come from a scripted transport.
//!
//! env:
//!   CHAT_BASE_URL    (default http://localhost:8000)
//!   CHAT_PROJECT_ID  (project to talk to)
//!   CHAT_API_KEY     (bearer key)

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_chat_stream::{
    ChatClient, ChatCompletedEvt, ChatErrorEvt, ChatSession, ChatStreamPlugin, ChatUpdated,
    Endpoint, Role, ScriptedTransport, SessionState, cancel_chat, send_user_text,
};

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct Panel;
#[derive(Component)]
struct HistoryText;
#[derive(Component)]
struct StatusText;
#[derive(Component)]
struct PromptText;

#[derive(Resource)]
struct Session(Entity);

#[derive(Resource, Default)]
struct PromptBuf(String);

// ---------------------- main ----------------------

fn build_client() -> ChatClient {
    let project = std::env::var("CHAT_PROJECT_ID").unwrap_or_default();
    if project.is_empty() {
        info!(target: "chat_demo", "CHAT_PROJECT_ID unset; using scripted replies");
        return ChatClient::new(ScriptedTransport::from_fragments(
            &["Hel", "lo! ", "this reply ", "was **streamed** ", "in fragments."],
            true,
        ));
    }
    let base = std::env::var("CHAT_BASE_URL")
        .unwrap_or_else(|_| bevy_chat_stream::config::DEFAULT_BASE_URL.to_string());
    let key = std::env::var("CHAT_API_KEY").unwrap_or_default();
    let endpoint = Endpoint::new(project, key).with_base_url(base);
    info!(target: "chat_demo", "endpoint: {:?}", endpoint);
    ChatClient::http(endpoint)
}

fn main() {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(build_client())
        .insert_resource(PromptBuf::default())
        .add_plugins(DefaultPlugins)
        .add_plugins(ChatStreamPlugin)
        .add_systems(Startup, setup)
        .add_systems(Update, (handle_text_input, refresh_prompt_text))
        // event readers should run after the plugin emits events
        .add_systems(
            Update,
            (on_update, on_done, on_error).after(bevy_chat_stream::ChatSet::Drain),
        )
        .run();
}

// ---------------------- setup ui ----------------------

fn setup(mut commands: Commands) {
    commands.spawn(Camera2d);

    let session = commands.spawn(ChatSession { stream: true }).id();
    commands.insert_resource(Session(session));

    let style_18 = TextFont { font_size: 18.0, ..default() };
    let style_14 = TextFont { font_size: 14.0, ..default() };

    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::srgb(0.10, 0.10, 0.12)),
            Panel,
        ))
        .with_children(|p| {
            p.spawn((Text::new(""), style_18.clone(), TextColor(Color::WHITE), HistoryText));
            p.spawn((
                Text::new("idle"),
                style_14.clone(),
                TextColor(Color::srgb_u8(160, 160, 160)),
                StatusText,
            ));
            p.spawn((Text::new("> "), style_14.clone(), TextColor(Color::WHITE), PromptText));
        });
}

// ---------------------- input ----------------------

fn handle_text_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    session: Res<Session>,
    mut q_panel: Query<&mut Visibility, With<Panel>>,
) {
    let ctrl = keys.pressed(KeyCode::ControlLeft) || keys.pressed(KeyCode::ControlRight);

    // ctrl+/ toggles the panel
    if ctrl && keys.just_pressed(KeyCode::Slash) {
        for mut v in &mut q_panel {
            *v = match *v {
                Visibility::Hidden => Visibility::Inherited,
                _ => Visibility::Hidden,
            };
        }
        ev_kbd.clear();
        return;
    }

    // escape aborts the running reply
    if keys.just_pressed(KeyCode::Escape) {
        cancel_chat(&mut commands, session.0);
    }

    for ev in ev_kbd.read() {
        if ev.state.is_pressed() && !ctrl {
            if let Some(txt) = &ev.text {
                let s = txt.replace('\r', "").replace('\n', "");
                prompt.0.push_str(&s);
            }
        }
    }

    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }

    if keys.just_pressed(KeyCode::Enter) && !prompt.0.trim().is_empty() {
        let msg = std::mem::take(&mut prompt.0);
        send_user_text(&mut commands, session.0, msg);
    }
}

fn refresh_prompt_text(prompt: Res<PromptBuf>, mut q_prompt: Query<&mut Text, With<PromptText>>) {
    if prompt.is_changed() {
        if let Ok(mut t) = q_prompt.single_mut() {
            t.0 = format!("> {} |", prompt.0);
        }
    }
}

// ---------------------- chat events ----------------------

fn render(state: &SessionState) -> String {
    let mut out = String::new();
    for turn in &state.transcript {
        let who = match turn.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        out.push_str(who);
        out.push_str(": ");
        out.push_str(&turn.content);
        out.push('\n');
    }
    out
}

fn on_update(
    mut ev: EventReader<ChatUpdated>,
    session: Res<Session>,
    mut q_hist: Query<&mut Text, (With<HistoryText>, Without<StatusText>)>,
    mut q_status: Query<&mut Text, (With<StatusText>, Without<HistoryText>)>,
) {
    // only the newest snapshot of this frame matters for display
    let Some(latest) = ev.read().filter(|u| u.entity == session.0).last() else {
        return;
    };
    if let Ok(mut h) = q_hist.single_mut() {
        h.0 = render(&latest.state);
    }
    if let Ok(mut s) = q_status.single_mut() {
        s.0 = if latest.state.busy { "streaming... (esc to stop)".into() } else { "idle".into() };
    }
}

fn on_done(mut ev: EventReader<ChatCompletedEvt>) {
    for ChatCompletedEvt { entity, final_text, end } in ev.read() {
        info!(target: "chat_demo",
            "reply done (entity={:?}, end={:?}, len={})",
            entity, end, final_text.as_deref().map_or(0, str::len)
        );
    }
}

fn on_error(mut ev: EventReader<ChatErrorEvt>, mut q: Query<&mut Text, With<StatusText>>) {
    for ChatErrorEvt { entity, error } in ev.read() {
        error!(target: "chat_demo", "chat error (entity={:?}): {}", entity, error);
        if let Ok(mut t) = q.single_mut() {
            t.0 = format!("ERROR: {}", error);
        }
    }
}
