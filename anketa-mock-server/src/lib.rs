use std::{
    collections::{btree_map, BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use anketa_api::{
    Answer, AnswerDetail, AnswerId, AnswerMeta, AnswerPatch, AuthInfo, AuthToken, AvailableForms,
    CompletedForm, Error, Form, FormId, FormPatch, FormSummary, NewAnswer, NewForm, NewSession,
    NewUser, Notification, ReviewDb, ReviewState, ReviewSubmit, Revision, Status, User, UserId,
    Uuid,
};

/// In-memory stand-in for the real server: one method per route, with the
/// same result contract, backed by plain maps instead of postgres.
pub struct MockServer {
    users: BTreeMap<UserId, MockUser>,
    sessions: HashMap<AuthToken, Session>,
    forms: BTreeMap<FormId, Form>,
    answers: BTreeMap<AnswerId, Answer>,
    statuses: MemStore,
    notifications: Vec<Notification>,
}

#[derive(Debug)]
struct MockUser {
    user: User,
    email: String,
    // tests (of which mock-server is a part of) don't actually use bcrypt
    password: String,
}

#[derive(Debug)]
struct Session {
    user: UserId,
    #[allow(dead_code)]
    device: String,
}

impl MockServer {
    pub fn new() -> MockServer {
        MockServer {
            users: BTreeMap::new(),
            sessions: HashMap::new(),
            forms: BTreeMap::new(),
            answers: BTreeMap::new(),
            statuses: MemStore::new(),
            notifications: Vec::new(),
        }
    }

    /// Notifications recorded so far, oldest first.
    pub fn test_notifications(&self) -> &[Notification] {
        &self.notifications
    }

    /// Direct handle on the status rows, for tests that drive the
    /// compare-and-swap layer without going through a session.
    pub fn test_statuses(&self) -> MemStore {
        self.statuses.clone()
    }

    pub fn register(&mut self, u: NewUser) -> Result<(), Error> {
        self.create_user(NewUser {
            is_admin: false,
            ..u
        })
    }

    pub fn admin_create_user(&mut self, u: NewUser) -> Result<(), Error> {
        self.create_user(u)
    }

    fn create_user(&mut self, u: NewUser) -> Result<(), Error> {
        u.validate()?;

        if self.users.values().any(|mu| mu.email == u.email) {
            return Err(Error::EmailAlreadyUsed(u.email));
        }

        match self.users.entry(u.id) {
            btree_map::Entry::Occupied(_) => Err(Error::UuidAlreadyUsed(u.id.0)),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(MockUser {
                    user: User {
                        id: u.id,
                        name: u.name,
                        surname: u.surname,
                        is_admin: u.is_admin,
                    },
                    email: u.email,
                    password: u.password,
                });
                Ok(())
            }
        }
    }

    pub fn auth(&mut self, s: NewSession) -> Result<AuthToken, Error> {
        s.validate()?;
        for (id, u) in self.users.iter() {
            if u.email == s.email {
                if s.password != u.password {
                    return Err(Error::PermissionDenied);
                }
                let tok = AuthToken(Uuid::new_v4());
                self.sessions.insert(
                    tok,
                    Session {
                        user: *id,
                        device: s.device,
                    },
                );
                return Ok(tok);
            }
        }
        Err(Error::PermissionDenied)
    }

    fn resolve(&self, tok: AuthToken) -> Result<UserId, Error> {
        self.sessions
            .get(&tok)
            .map(|s| s.user)
            .ok_or(Error::PermissionDenied)
    }

    fn is_admin(&self, user: UserId) -> bool {
        self.users.get(&user).map_or(false, |u| u.user.is_admin)
    }

    pub fn unauth(&mut self, tok: AuthToken) -> Result<(), Error> {
        self.resolve(tok)?;
        self.sessions.remove(&tok);
        Ok(())
    }

    pub fn whoami(&self, tok: AuthToken) -> Result<User, Error> {
        let user = self.resolve(tok)?;
        Ok(self.users[&user].user.clone())
    }

    pub fn create_form(&mut self, tok: AuthToken, f: NewForm) -> Result<(), Error> {
        f.validate()?;
        let user = self.resolve(tok)?;
        if !self.is_admin(user) {
            return Err(Error::PermissionDenied);
        }
        match self.forms.entry(f.id) {
            btree_map::Entry::Occupied(_) => Err(Error::UuidAlreadyUsed(f.id.0)),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(Form {
                    id: f.id,
                    owner_id: user,
                    name: f.name,
                    fields: f.fields,
                    closed: false,
                });
                Ok(())
            }
        }
    }

    pub fn update_form(&mut self, tok: AuthToken, id: FormId, p: FormPatch) -> Result<(), Error> {
        p.validate()?;
        let user = self.resolve(tok)?;
        let admin = self.is_admin(user);
        let form = self
            .forms
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(String::from("form")))?;
        if form.owner_id != user && !admin {
            return Err(Error::PermissionDenied);
        }
        form.name = p.name;
        form.fields = p.fields;
        Ok(())
    }

    pub fn set_form_closed(
        &mut self,
        tok: AuthToken,
        id: FormId,
        closed: bool,
    ) -> Result<(), Error> {
        let user = self.resolve(tok)?;
        let admin = self.is_admin(user);
        let form = self
            .forms
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(String::from("form")))?;
        if form.owner_id != user && !admin {
            return Err(Error::PermissionDenied);
        }
        form.closed = closed;
        Ok(())
    }

    pub fn fetch_form(&self, tok: AuthToken, id: FormId) -> Result<Form, Error> {
        self.resolve(tok)?;
        self.forms
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(String::from("form")))
    }

    pub fn fetch_own_forms(&self, tok: AuthToken) -> Result<Vec<FormSummary>, Error> {
        let user = self.resolve(tok)?;
        Ok(self
            .forms
            .values()
            .filter(|f| f.owner_id == user)
            .map(summary)
            .collect())
    }

    pub fn fetch_available_forms(&self, tok: AuthToken) -> Result<AvailableForms, Error> {
        let user = self.resolve(tok)?;
        let mine: HashMap<FormId, AnswerId> = self
            .answers
            .values()
            .filter(|a| a.owner_id == user)
            .map(|a| (a.form_id, a.id))
            .collect();
        let mut res = AvailableForms {
            available: Vec::new(),
            completed: Vec::new(),
        };
        for f in self.forms.values() {
            match mine.get(&f.id) {
                None => res.available.push(summary(f)),
                Some(answer_id) => res.completed.push(CompletedForm {
                    answer_id: *answer_id,
                    form: summary(f),
                    status: self
                        .statuses
                        .snapshot(*answer_id)
                        .ok_or_else(|| Error::NotFound(String::from("status")))?,
                }),
            }
        }
        Ok(res)
    }

    pub fn submit_answer(&mut self, tok: AuthToken, a: NewAnswer) -> Result<(), Error> {
        a.validate()?;
        let user = self.resolve(tok)?;
        let form = self
            .forms
            .get(&a.form_id)
            .ok_or_else(|| Error::NotFound(String::from("form")))?;
        if form.closed {
            return Err(Error::FormClosed(form.id));
        }
        form.validate_answer(&a.fields)?;
        if self
            .answers
            .values()
            .any(|ans| ans.form_id == a.form_id && ans.owner_id == user)
        {
            return Err(Error::AlreadyAnswered(a.form_id));
        }
        match self.answers.entry(a.id) {
            btree_map::Entry::Occupied(_) => Err(Error::UuidAlreadyUsed(a.id.0)),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(Answer {
                    id: a.id,
                    form_id: a.form_id,
                    owner_id: user,
                    fields: a.fields,
                });
                self.statuses.insert(a.id);
                Ok(())
            }
        }
    }

    pub fn edit_answer(&mut self, tok: AuthToken, id: AnswerId, p: AnswerPatch) -> Result<(), Error> {
        p.validate()?;
        let user = self.resolve(tok)?;
        let answer = self
            .answers
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(String::from("answer")))?;
        if answer.owner_id != user {
            return Err(Error::PermissionDenied);
        }
        let form = &self.forms[&answer.form_id];
        form.validate_answer(&p.fields)?;
        answer.fields = p.fields;
        self.statuses.reset_to_waiting(id);
        Ok(())
    }

    pub fn fetch_answer(&self, tok: AuthToken, id: AnswerId) -> Result<AnswerDetail, Error> {
        let user = self.resolve(tok)?;
        let answer = self
            .answers
            .get(&id)
            .ok_or_else(|| Error::NotFound(String::from("answer")))?;
        let form = self.forms[&answer.form_id].clone();
        if answer.owner_id != user && form.owner_id != user && !self.is_admin(user) {
            return Err(Error::PermissionDenied);
        }
        Ok(AnswerDetail {
            answer: answer.clone(),
            owner: self.users[&answer.owner_id].user.clone(),
            form,
            status: self
                .statuses
                .snapshot(id)
                .ok_or_else(|| Error::NotFound(String::from("status")))?,
        })
    }

    pub fn fetch_form_answers(
        &self,
        tok: AuthToken,
        id: FormId,
    ) -> Result<Vec<AnswerDetail>, Error> {
        let user = self.resolve(tok)?;
        let form = self
            .forms
            .get(&id)
            .ok_or_else(|| Error::NotFound(String::from("form")))?;
        if form.owner_id != user && !self.is_admin(user) {
            return Err(Error::PermissionDenied);
        }
        let mut res = Vec::new();
        for answer in self.answers.values().filter(|a| a.form_id == id) {
            res.push(AnswerDetail {
                answer: answer.clone(),
                owner: self.users[&answer.owner_id].user.clone(),
                form: form.clone(),
                status: self
                    .statuses
                    .snapshot(answer.id)
                    .ok_or_else(|| Error::NotFound(String::from("status")))?,
            });
        }
        Ok(res)
    }

    pub async fn submit_review(
        &mut self,
        tok: AuthToken,
        id: AnswerId,
        sub: ReviewSubmit,
    ) -> Result<Status, Error> {
        let user = self.resolve(tok)?;
        let mut db = MockDb { srv: self, user };
        let outcome = anketa_api::submit_review(&mut db, id, sub)
            .await
            .map_err(|err| Error::Unknown(format!("{err:#}")))??;
        if let Some(n) = outcome.notification {
            self.notifications.push(n);
        }
        Ok(outcome.status)
    }
}

fn summary(f: &Form) -> FormSummary {
    FormSummary {
        id: f.id,
        name: f.name.clone(),
        closed: f.closed,
    }
}

struct MockDb<'a> {
    srv: &'a mut MockServer,
    user: UserId,
}

#[async_trait::async_trait]
impl ReviewDb for MockDb<'_> {
    fn current_user(&self) -> UserId {
        self.user
    }

    async fn auth_info_for(&mut self, answer: AnswerId) -> anyhow::Result<AuthInfo> {
        let a = match self.srv.answers.get(&answer) {
            None => return Ok(AuthInfo::none()),
            Some(a) => a,
        };
        let form_owner = self.srv.forms.get(&a.form_id).map(|f| f.owner_id);
        let is_reviewer = form_owner == Some(self.user) || self.srv.is_admin(self.user);
        Ok(AuthInfo::for_roles(a.owner_id == self.user, is_reviewer))
    }

    async fn answer_meta(&mut self, answer: AnswerId) -> anyhow::Result<Option<AnswerMeta>> {
        let a = match self.srv.answers.get(&answer) {
            None => return Ok(None),
            Some(a) => a,
        };
        let form = self
            .srv
            .forms
            .get(&a.form_id)
            .ok_or_else(|| anyhow::anyhow!("answer {answer:?} references a missing form"))?;
        let owner = self
            .srv
            .users
            .get(&a.owner_id)
            .ok_or_else(|| anyhow::anyhow!("answer {answer:?} references a missing user"))?;
        Ok(Some(AnswerMeta {
            form_id: form.id,
            form_name: form.name.clone(),
            owner_id: a.owner_id,
            owner_email: owner.email.clone(),
        }))
    }

    async fn display_name(&mut self, user: UserId) -> anyhow::Result<String> {
        self.srv
            .users
            .get(&user)
            .map(|u| u.user.display_name())
            .ok_or_else(|| anyhow::anyhow!("no user {user:?} in mock db"))
    }

    async fn load_status(
        &mut self,
        answer: AnswerId,
    ) -> anyhow::Result<Option<(Status, Revision)>> {
        Ok(self.srv.statuses.load(answer))
    }

    async fn store_status(
        &mut self,
        answer: AnswerId,
        expect: Revision,
        status: &Status,
    ) -> anyhow::Result<bool> {
        Ok(self.srv.statuses.store(answer, expect, status))
    }
}

/// Status rows with the same revisioned compare-and-swap contract the
/// postgres layer provides. Cloning shares the underlying rows.
#[derive(Clone, Default)]
pub struct MemStore(Arc<Mutex<HashMap<AnswerId, (Status, Revision)>>>);

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    pub fn insert(&self, answer: AnswerId) {
        self.0
            .lock()
            .unwrap()
            .insert(answer, (Status::waiting(), 0));
    }

    pub fn snapshot(&self, answer: AnswerId) -> Option<Status> {
        self.0.lock().unwrap().get(&answer).map(|(s, _)| s.clone())
    }

    pub fn load(&self, answer: AnswerId) -> Option<(Status, Revision)> {
        self.0.lock().unwrap().get(&answer).cloned()
    }

    /// Write back only if the row is still at revision `expect`.
    pub fn store(&self, answer: AnswerId, expect: Revision, status: &Status) -> bool {
        let mut rows = self.0.lock().unwrap();
        match rows.get_mut(&answer) {
            Some((row, revision)) if *revision == expect => {
                *row = status.clone();
                *revision += 1;
                true
            }
            _ => false,
        }
    }

    /// Unconditional owner-edit reset: back to waiting, comments kept, and
    /// the revision bump makes any concurrent reviewer write retry.
    pub fn reset_to_waiting(&self, answer: AnswerId) {
        let mut rows = self.0.lock().unwrap();
        if let Some((row, revision)) = rows.get_mut(&answer) {
            row.state = ReviewState::Waiting;
            *revision += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anketa_api::{CommentPath, FieldKind, FieldSpec};
    use std::collections::BTreeMap;

    fn new_user(email: &str, name: &str, surname: &str) -> NewUser {
        NewUser::new(
            String::from(email),
            String::from(name),
            String::from(surname),
            String::from("hunter2"),
        )
    }

    fn login(srv: &mut MockServer, email: &str) -> AuthToken {
        srv.auth(NewSession {
            email: String::from(email),
            password: String::from("hunter2"),
            device: String::from("tests"),
        })
        .expect("logging in")
    }

    fn feedback_fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec {
                id: String::from("full-name"),
                label: String::from("Your name"),
                kind: FieldKind::Text,
                required: true,
                options: Vec::new(),
            },
            FieldSpec {
                id: String::from("notes"),
                label: String::from("Anything else?"),
                kind: FieldKind::Textarea,
                required: false,
                options: Vec::new(),
            },
        ]
    }

    fn answer_fields(name: &str) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert(String::from("full-name"), String::from(name));
        fields
    }

    struct Setup {
        srv: MockServer,
        reviewer: AuthToken,
        respondent: AuthToken,
        form: FormId,
        answer: AnswerId,
    }

    /// One admin-owned form, answered once by a regular user.
    fn setup() -> Setup {
        let mut srv = MockServer::new();

        let mut admin = new_user("anna@example.com", "Anna", "Orlova");
        admin.is_admin = true;
        srv.admin_create_user(admin).unwrap();
        srv.register(new_user("ivan@example.com", "Ivan", "Petrov"))
            .unwrap();

        let reviewer = login(&mut srv, "anna@example.com");
        let respondent = login(&mut srv, "ivan@example.com");

        let form = NewForm::new(String::from("course feedback"), feedback_fields());
        let form_id = form.id;
        srv.create_form(reviewer, form).unwrap();

        let answer = NewAnswer::new(form_id, answer_fields("Ivan Petrov"));
        let answer_id = answer.id;
        srv.submit_answer(respondent, answer).unwrap();

        Setup {
            srv,
            reviewer,
            respondent,
            form: form_id,
            answer: answer_id,
        }
    }

    fn comment_at(text: &str, path: Option<Vec<usize>>) -> ReviewSubmit {
        ReviewSubmit {
            status: None,
            comment: Some(String::from(text)),
            reply_to: path.map(CommentPath),
        }
    }

    fn status_and_comment(state: ReviewState, text: &str) -> ReviewSubmit {
        ReviewSubmit {
            status: Some(state.flags()),
            comment: Some(String::from(text)),
            reply_to: None,
        }
    }

    #[test]
    fn fresh_answer_is_waiting_with_no_comments() {
        let s = setup();
        let detail = s.srv.fetch_answer(s.respondent, s.answer).unwrap();
        assert_eq!(detail.status.state, ReviewState::Waiting);
        assert!(detail.status.comments.is_empty());
        assert_eq!(detail.owner.display_name(), "Ivan Petrov");
    }

    #[test]
    fn registration_conflicts_are_reported() {
        let mut s = setup();
        assert_eq!(
            s.srv.register(new_user("ivan@example.com", "Ivan", "Petrov")),
            Err(Error::EmailAlreadyUsed(String::from("ivan@example.com"))),
        );
        let mut dup = new_user("other@example.com", "Other", "User");
        dup.id = s.srv.whoami(s.respondent).unwrap().id;
        assert_eq!(s.srv.register(dup.clone()), Err(Error::UuidAlreadyUsed(dup.id.0)));
    }

    #[test]
    fn self_registration_never_grants_admin() {
        let mut srv = MockServer::new();
        let mut sneaky = new_user("eve@example.com", "Eve", "Adams");
        sneaky.is_admin = true;
        srv.register(sneaky).unwrap();
        let tok = login(&mut srv, "eve@example.com");
        assert!(!srv.whoami(tok).unwrap().is_admin);
        assert_eq!(
            srv.create_form(
                tok,
                NewForm::new(String::from("no"), Vec::new()),
            ),
            Err(Error::PermissionDenied),
        );
    }

    #[tokio::test]
    async fn approving_with_comment_updates_status_and_notifies() {
        let mut s = setup();
        let status = s
            .srv
            .submit_review(
                s.reviewer,
                s.answer,
                status_and_comment(ReviewState::Approved, "well done"),
            )
            .await
            .unwrap();
        assert_eq!(status.state, ReviewState::Approved);
        assert_eq!(status.comments.size(), 1);
        assert_eq!(status.comments.0[0].sender, "Anna Orlova");

        let sent = s.srv.test_notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ivan@example.com");
        assert_eq!(sent[0].form_name, "course feedback");
        assert_eq!(sent[0].status, "approved");
        assert_eq!(sent[0].comment, "well done");
    }

    #[tokio::test]
    async fn owner_reply_nests_under_reviewer_comment() {
        let mut s = setup();
        s.srv
            .submit_review(
                s.reviewer,
                s.answer,
                status_and_comment(ReviewState::EditsRequired, "please fix section 2"),
            )
            .await
            .unwrap();
        let status = s
            .srv
            .submit_review(s.respondent, s.answer, comment_at("done", Some(vec![0])))
            .await
            .unwrap();

        assert_eq!(status.comments.0[0].replies.len(), 1);
        assert_eq!(status.comments.0[0].replies[0].text, "done");
        assert_eq!(status.comments.0[0].replies[0].sender, "Ivan Petrov");
        // A bare comment triggers nothing, whoever sends it.
        assert_eq!(s.srv.test_notifications().len(), 1);
    }

    #[tokio::test]
    async fn replies_nest_at_any_depth() {
        let mut s = setup();
        s.srv
            .submit_review(s.reviewer, s.answer, comment_at("A", None))
            .await
            .unwrap();
        s.srv
            .submit_review(s.respondent, s.answer, comment_at("B", Some(vec![0])))
            .await
            .unwrap();
        let status = s
            .srv
            .submit_review(s.reviewer, s.answer, comment_at("C", Some(vec![0, 0])))
            .await
            .unwrap();

        assert_eq!(status.comments.size(), 3);
        assert_eq!(status.comments.0[0].replies[0].replies[0].text, "C");
    }

    #[tokio::test]
    async fn dangling_reply_path_changes_nothing() {
        let mut s = setup();
        s.srv
            .submit_review(s.reviewer, s.answer, comment_at("A", None))
            .await
            .unwrap();
        let res = s
            .srv
            .submit_review(s.reviewer, s.answer, comment_at("lost", Some(vec![5])))
            .await;
        assert_eq!(res, Err(Error::InvalidCommentPath(CommentPath(vec![5]))));

        let detail = s.srv.fetch_answer(s.reviewer, s.answer).unwrap();
        assert_eq!(detail.status.comments.size(), 1);
    }

    #[tokio::test]
    async fn respondent_cannot_touch_status_flags() {
        let mut s = setup();
        let res = s
            .srv
            .submit_review(
                s.respondent,
                s.answer,
                ReviewSubmit {
                    status: Some(ReviewState::Approved.flags()),
                    comment: None,
                    reply_to: None,
                },
            )
            .await;
        assert_eq!(res, Err(Error::PermissionDenied));
    }

    #[tokio::test]
    async fn strangers_see_and_touch_nothing() {
        let mut s = setup();
        s.srv
            .register(new_user("eve@example.com", "Eve", "Adams"))
            .unwrap();
        let eve = login(&mut s.srv, "eve@example.com");

        assert_eq!(
            s.srv.fetch_answer(eve, s.answer),
            Err(Error::PermissionDenied),
        );
        assert_eq!(
            s.srv.fetch_form_answers(eve, s.form),
            Err(Error::PermissionDenied),
        );
        assert_eq!(
            s.srv
                .submit_review(eve, s.answer, comment_at("hello", None))
                .await,
            Err(Error::PermissionDenied),
        );
    }

    #[tokio::test]
    async fn admins_review_forms_they_do_not_own() {
        let mut s = setup();
        let mut second = new_user("boss@example.com", "Boss", "Adminov");
        second.is_admin = true;
        s.srv.admin_create_user(second).unwrap();
        let boss = login(&mut s.srv, "boss@example.com");

        let status = s
            .srv
            .submit_review(
                boss,
                s.answer,
                ReviewSubmit {
                    status: Some(ReviewState::Rejected.flags()),
                    comment: None,
                    reply_to: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(status.state, ReviewState::Rejected);
    }

    #[tokio::test]
    async fn editing_answer_resets_status_and_keeps_comments() {
        let mut s = setup();
        s.srv
            .submit_review(
                s.reviewer,
                s.answer,
                status_and_comment(ReviewState::EditsRequired, "please fix section 2"),
            )
            .await
            .unwrap();

        s.srv
            .edit_answer(
                s.respondent,
                s.answer,
                AnswerPatch {
                    fields: answer_fields("Ivan P. Petrov"),
                },
            )
            .unwrap();

        let detail = s.srv.fetch_answer(s.respondent, s.answer).unwrap();
        assert_eq!(detail.status.state, ReviewState::Waiting);
        assert_eq!(detail.status.comments.size(), 1);
        assert_eq!(detail.answer.fields["full-name"], "Ivan P. Petrov");
    }

    #[tokio::test]
    async fn only_the_owner_edits_an_answer() {
        let mut s = setup();
        let res = s.srv.edit_answer(
            s.reviewer,
            s.answer,
            AnswerPatch {
                fields: answer_fields("Impostor"),
            },
        );
        assert_eq!(res, Err(Error::PermissionDenied));
    }

    #[test]
    fn closed_forms_take_no_new_answers() {
        let mut s = setup();
        s.srv
            .register(new_user("olga@example.com", "Olga", "Ivanova"))
            .unwrap();
        let olga = login(&mut s.srv, "olga@example.com");

        s.srv.set_form_closed(s.reviewer, s.form, true).unwrap();
        assert_eq!(
            s.srv
                .submit_answer(olga, NewAnswer::new(s.form, answer_fields("Olga"))),
            Err(Error::FormClosed(s.form)),
        );

        // The existing respondent can still rework their answer.
        s.srv
            .edit_answer(
                s.respondent,
                s.answer,
                AnswerPatch {
                    fields: answer_fields("Ivan again"),
                },
            )
            .unwrap();
    }

    #[test]
    fn one_answer_per_user_per_form() {
        let mut s = setup();
        assert_eq!(
            s.srv
                .submit_answer(s.respondent, NewAnswer::new(s.form, answer_fields("Ivan"))),
            Err(Error::AlreadyAnswered(s.form)),
        );
    }

    #[test]
    fn answered_forms_move_to_the_completed_list() {
        let mut s = setup();
        let listing = s.srv.fetch_available_forms(s.respondent).unwrap();
        assert!(listing.available.is_empty());
        assert_eq!(listing.completed.len(), 1);
        assert_eq!(listing.completed[0].answer_id, s.answer);
        assert_eq!(listing.completed[0].status.state, ReviewState::Waiting);

        s.srv
            .register(new_user("olga@example.com", "Olga", "Ivanova"))
            .unwrap();
        let olga = login(&mut s.srv, "olga@example.com");
        let listing = s.srv.fetch_available_forms(olga).unwrap();
        assert_eq!(listing.available.len(), 1);
        assert!(listing.completed.is_empty());
    }

    #[test]
    fn sessions_stop_working_after_logout() {
        let mut s = setup();
        s.srv.unauth(s.respondent).unwrap();
        assert_eq!(
            s.srv.whoami(s.respondent),
            Err(Error::PermissionDenied),
        );
        assert_eq!(s.srv.unauth(s.respondent), Err(Error::PermissionDenied));
    }

    #[test]
    fn stale_revision_writes_lose() {
        let store = MemStore::new();
        let answer = AnswerId(Uuid::new_v4());
        store.insert(answer);

        let (status, revision) = store.load(answer).unwrap();
        assert!(store.store(answer, revision, &status));
        // Same revision again: someone else won in between.
        assert!(!store.store(answer, revision, &status));
        assert_eq!(store.load(answer).unwrap().1, revision + 1);
    }

    /// Two reviewers race on one answer. Each lost compare-and-swap is
    /// re-applied on a fresh read, so both comments survive whatever the
    /// interleaving; the flags end up with whichever write landed last.
    #[tokio::test]
    async fn racing_reviews_never_drop_comments() {
        const RACER_A: UserId = UserId(anketa_api::uuid!("00000000-0000-0000-0000-00000000000a"));
        const RACER_B: UserId = UserId(anketa_api::uuid!("00000000-0000-0000-0000-00000000000b"));

        struct RacingDb {
            store: MemStore,
            user: UserId,
        }

        #[async_trait::async_trait]
        impl ReviewDb for RacingDb {
            fn current_user(&self) -> UserId {
                self.user
            }

            async fn auth_info_for(&mut self, _answer: AnswerId) -> anyhow::Result<AuthInfo> {
                Ok(AuthInfo::for_roles(false, true))
            }

            async fn answer_meta(
                &mut self,
                _answer: AnswerId,
            ) -> anyhow::Result<Option<AnswerMeta>> {
                Ok(Some(AnswerMeta {
                    form_id: FormId::stub(),
                    form_name: String::from("raced form"),
                    owner_id: UserId::stub(),
                    owner_email: String::from("owner@example.com"),
                }))
            }

            async fn display_name(&mut self, user: UserId) -> anyhow::Result<String> {
                Ok(String::from(if user == RACER_A {
                    "Racer One"
                } else {
                    "Racer Two"
                }))
            }

            async fn load_status(
                &mut self,
                answer: AnswerId,
            ) -> anyhow::Result<Option<(Status, Revision)>> {
                Ok(self.store.load(answer))
            }

            async fn store_status(
                &mut self,
                answer: AnswerId,
                expect: Revision,
                status: &Status,
            ) -> anyhow::Result<bool> {
                // Give the other racer a chance to sneak in between our
                // read and our write.
                tokio::task::yield_now().await;
                Ok(self.store.store(answer, expect, status))
            }
        }

        let store = MemStore::new();
        let answer = AnswerId(Uuid::new_v4());
        store.insert(answer);

        let submit = |user, text: &str, state| {
            let mut db = RacingDb {
                store: store.clone(),
                user,
            };
            let sub = ReviewSubmit {
                status: Some(ReviewState::flags(state)),
                comment: Some(String::from(text)),
                reply_to: None,
            };
            tokio::spawn(async move { anketa_api::submit_review(&mut db, answer, sub).await })
        };

        let a = submit(RACER_A, "looks good", ReviewState::Approved);
        let b = submit(RACER_B, "needs work", ReviewState::EditsRequired);
        let a = a.await.unwrap().unwrap().unwrap();
        let b = b.await.unwrap().unwrap().unwrap();
        assert!(a.notification.is_some());
        assert!(b.notification.is_some());

        let (status, revision) = store.load(answer).unwrap();
        let mut texts: Vec<_> = status.comments.0.iter().map(|c| c.text.clone()).collect();
        texts.sort();
        assert_eq!(texts, vec!["looks good", "needs work"]);
        assert!(revision >= 2);
    }
}
